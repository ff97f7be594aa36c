//! Acceptor and readiness selector. One poll thread owns the listener and
//! the readiness loop; a fixed pool of workers drains per-connection jobs.
//! Each connection carries a claim gate so handler execution for one
//! session is strictly serialized while distinct sessions run in parallel
//! across the pool. Collaborators reach a session only through its post
//! queue, never by touching the socket or session state directly.

use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::config::NetConfig;
use crate::entities::player::PlayerRecord;
use crate::net::auth::{AuthOutcome, AuthReply, AuthRequest, AuthSink, Authenticator};
use crate::net::cipher::SessionCipher;
use crate::net::frame::{encode_frame, FrameDecoder, FRAME_HEADER_BYTES};
use crate::net::packet::PacketReader;
use crate::net::registry::{HandlerRegistry, Resolution};
use crate::net::server_packets::{
    build_chat_say, build_disconnect_notice, build_enter_world, build_ex_who_response,
};
use crate::net::session::{
    flush_queue, CloseReason, FlushOutcome, HandlerAction, OutboundQueue, Session, SessionState,
};
use crate::net::throttle::AcceptThrottle;
use crate::net::trace::PacketTrace;
use crate::telemetry::logging;
use crate::world::registry::{SessionPoster, WorldRegistry};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const FIRST_SESSION_ID: u64 = 2;

const READ_CHUNK: usize = 4096;
const EVENT_CAPACITY: usize = 256;
const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    Shutdown,
    Restart,
}

const SIGNAL_RUNNING: u8 = 0;
const SIGNAL_SHUTDOWN: u8 = 1;
const SIGNAL_RESTART: u8 = 2;

/// Cross-thread stop/restart handle, usable from signal handlers or an
/// admin surface. Waking the poll thread makes the request prompt.
pub struct ServerControl {
    signal: AtomicU8,
    waker: OnceLock<Waker>,
}

impl ServerControl {
    pub fn new() -> Self {
        Self {
            signal: AtomicU8::new(SIGNAL_RUNNING),
            waker: OnceLock::new(),
        }
    }

    pub fn request_shutdown(&self) {
        self.signal.store(SIGNAL_SHUTDOWN, Ordering::SeqCst);
        self.wake();
    }

    pub fn request_restart(&self) {
        self.signal.store(SIGNAL_RESTART, Ordering::SeqCst);
        self.wake();
    }

    pub fn is_running(&self) -> bool {
        self.signal.load(Ordering::SeqCst) == SIGNAL_RUNNING
    }

    pub fn exit_reason(&self) -> ServerExit {
        if self.signal.load(Ordering::SeqCst) == SIGNAL_RESTART {
            ServerExit::Restart
        } else {
            ServerExit::Shutdown
        }
    }

    fn attach_waker(&self, waker: Waker) {
        let _ = self.waker.set(waker);
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.get() {
            let _ = waker.wake();
        }
    }
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection claim gate. A connection is serviced by at most one
/// worker at a time; schedulers that lose the claim race leave a dirty
/// mark the owning worker honors before releasing.
struct ClaimGate {
    claimed: AtomicBool,
    dirty: AtomicBool,
}

impl ClaimGate {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    /// Marks work pending and claims the gate when free. Returns true
    /// when the caller must submit a job for the new owner.
    fn try_claim(&self) -> bool {
        self.dirty.store(true, Ordering::SeqCst);
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Runs `work` until no dirty mark remains, then releases. The
    /// release/re-check dance closes the window where a scheduler marks
    /// dirty right as the owner is letting go.
    fn service(&self, mut work: impl FnMut()) {
        loop {
            self.dirty.store(false, Ordering::SeqCst);
            work();
            self.claimed.store(false, Ordering::SeqCst);
            if self.dirty.load(Ordering::SeqCst)
                && self
                    .claimed
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                continue;
            }
            return;
        }
    }
}

/// Work delivered to a session from outside its own socket.
enum Post {
    Frame(Arc<Vec<u8>>),
    AuthVerdict(AuthOutcome),
    Kick(CloseReason),
    ForceClose,
}

enum Job {
    Service(Arc<ConnEntry>),
    Exit,
}

struct ConnInner {
    stream: TcpStream,
    decoder: FrameDecoder,
    recv_cipher: Option<SessionCipher>,
    send_cipher: Option<SessionCipher>,
    session: Session,
    outbound: OutboundQueue,
    interest: Interest,
    drain_deadline: Option<Instant>,
    trace: Option<PacketTrace>,
}

struct ConnEntry {
    id: u64,
    token: Token,
    gate: ClaimGate,
    readable: AtomicBool,
    writable: AtomicBool,
    posts: Mutex<Vec<Post>>,
    state_tag: AtomicU8,
    inner: Mutex<ConnInner>,
}

impl ConnEntry {
    fn new(
        id: u64,
        token: Token,
        stream: TcpStream,
        peer: SocketAddr,
        nonce: u64,
        cfg: &NetConfig,
        trace: Option<PacketTrace>,
    ) -> Self {
        Self {
            id,
            token,
            gate: ClaimGate::new(),
            readable: AtomicBool::new(false),
            writable: AtomicBool::new(false),
            posts: Mutex::new(Vec::new()),
            state_tag: AtomicU8::new(SessionState::Connected.tag()),
            inner: Mutex::new(ConnInner {
                stream,
                decoder: FrameDecoder::new(cfg.max_frame_bytes),
                recv_cipher: None,
                send_cipher: None,
                session: Session::new(id, peer, nonce),
                outbound: OutboundQueue::new(
                    cfg.outbound_ceiling_messages,
                    cfg.outbound_ceiling_bytes,
                ),
                interest: Interest::READABLE,
                drain_deadline: None,
                trace,
            }),
        }
    }

    fn push_post(&self, post: Post) {
        match self.posts.lock() {
            Ok(mut posts) => posts.push(post),
            Err(poisoned) => poisoned.into_inner().push(post),
        }
    }

    fn take_posts(&self) -> Vec<Post> {
        match self.posts.lock() {
            Ok(mut posts) => std::mem::take(&mut *posts),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn schedule(self: &Arc<Self>, shared: &GateShared) {
        if self.gate.try_claim() {
            let _ = shared.jobs.send(Job::Service(Arc::clone(self)));
        }
    }
}

struct GateShared {
    cfg: NetConfig,
    root: Option<PathBuf>,
    registry: Arc<HandlerRegistry>,
    auth: Arc<dyn Authenticator>,
    world: Arc<WorldRegistry>,
    control: Arc<ServerControl>,
    conns: Mutex<HashMap<u64, Arc<ConnEntry>>>,
    jobs: Sender<Job>,
    poll_registry: Registry,
    next_id: AtomicU64,
    link: OnceLock<Arc<GateLink>>,
}

impl GateShared {
    fn conn(&self, session_id: u64) -> Option<Arc<ConnEntry>> {
        self.lock_conns().get(&session_id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<ConnEntry>> {
        self.lock_conns().values().cloned().collect()
    }

    fn insert(&self, entry: Arc<ConnEntry>) {
        self.lock_conns().insert(entry.id, entry);
    }

    fn remove(&self, session_id: u64) {
        self.lock_conns().remove(&session_id);
    }

    fn active_sessions(&self) -> usize {
        self.lock_conns().len()
    }

    fn auth_sink(&self) -> Option<Arc<dyn AuthSink>> {
        self.link
            .get()
            .map(|link| Arc::clone(link) as Arc<dyn AuthSink>)
    }

    fn lock_conns(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<ConnEntry>>> {
        match self.conns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The gate as seen by collaborators: world deliveries and kicks, auth
/// completions. Holds the shared state weakly so a stopped gate simply
/// drops late completions.
struct GateLink {
    shared: Weak<GateShared>,
}

impl GateLink {
    fn post_and_schedule(&self, session_id: u64, post: Post) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if let Some(entry) = shared.conn(session_id) {
            entry.push_post(post);
            entry.schedule(&shared);
        }
    }
}

impl SessionPoster for GateLink {
    fn deliver(&self, session_id: u64, body: Arc<Vec<u8>>) {
        self.post_and_schedule(session_id, Post::Frame(body));
    }

    fn kick_duplicate(&self, session_id: u64) {
        self.post_and_schedule(session_id, Post::Kick(CloseReason::DuplicateLogin));
    }
}

impl AuthSink for GateLink {
    fn complete(&self, session_id: u64, outcome: AuthOutcome) {
        self.post_and_schedule(session_id, Post::AuthVerdict(outcome));
    }
}

/// The session gate: listener, selector loop, and worker pool, wired to
/// its collaborators once at construction (no ambient lookups).
pub struct GateServer {
    cfg: NetConfig,
    root: Option<PathBuf>,
    registry: Arc<HandlerRegistry>,
    auth: Arc<dyn Authenticator>,
    world: Arc<WorldRegistry>,
    control: Arc<ServerControl>,
}

impl GateServer {
    pub fn new(
        cfg: NetConfig,
        root: Option<PathBuf>,
        registry: Arc<HandlerRegistry>,
        auth: Arc<dyn Authenticator>,
        world: Arc<WorldRegistry>,
        control: Arc<ServerControl>,
    ) -> Self {
        Self {
            cfg,
            root,
            registry,
            auth,
            world,
            control,
        }
    }

    pub fn bind(self) -> Result<BoundGate, String> {
        let addr: SocketAddr = self
            .cfg
            .bind_addr
            .parse()
            .map_err(|err| format!("bad bind address '{}': {}", self.cfg.bind_addr, err))?;
        let listener =
            TcpListener::bind(addr).map_err(|err| format!("bind {} failed: {}", addr, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| format!("local addr unavailable: {}", err))?;
        Ok(BoundGate {
            server: self,
            listener,
            local_addr,
        })
    }

    pub fn spawn(self) -> Result<RunningGate, String> {
        let bound = self.bind()?;
        let addr = bound.local_addr();
        let handle = thread::Builder::new()
            .name("gate-selector".to_string())
            .spawn(move || bound.run())
            .map_err(|err| format!("selector thread spawn failed: {}", err))?;
        Ok(RunningGate { addr, handle })
    }
}

pub struct RunningGate {
    addr: SocketAddr,
    handle: thread::JoinHandle<Result<ServerExit, String>>,
}

impl RunningGate {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn join(self) -> Result<ServerExit, String> {
        self.handle
            .join()
            .map_err(|_| "gate thread panicked".to_string())?
    }
}

pub struct BoundGate {
    server: GateServer,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundGate {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn run(mut self) -> Result<ServerExit, String> {
        let mut poll = Poll::new().map_err(|err| format!("poll create failed: {}", err))?;
        poll.registry()
            .register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|err| format!("listener register failed: {}", err))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|err| format!("waker create failed: {}", err))?;
        self.server.control.attach_waker(waker);
        let poll_registry = poll
            .registry()
            .try_clone()
            .map_err(|err| format!("registry clone failed: {}", err))?;

        let (jobs_tx, jobs_rx) = channel::<Job>();
        let shared = Arc::new(GateShared {
            cfg: self.server.cfg.clone(),
            root: self.server.root.clone(),
            registry: Arc::clone(&self.server.registry),
            auth: Arc::clone(&self.server.auth),
            world: Arc::clone(&self.server.world),
            control: Arc::clone(&self.server.control),
            conns: Mutex::new(HashMap::new()),
            jobs: jobs_tx,
            poll_registry,
            next_id: AtomicU64::new(FIRST_SESSION_ID),
            link: OnceLock::new(),
        });
        let link = Arc::new(GateLink {
            shared: Arc::downgrade(&shared),
        });
        let _ = shared.link.set(Arc::clone(&link));
        shared
            .world
            .attach_gate(link as Arc<dyn SessionPoster>)?;

        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let mut workers = Vec::new();
        for idx in 0..shared.cfg.worker_threads.max(1) {
            let shared = Arc::clone(&shared);
            let jobs_rx = Arc::clone(&jobs_rx);
            let worker = thread::Builder::new()
                .name(format!("gate-worker-{idx}"))
                .spawn(move || run_worker(shared, jobs_rx))
                .map_err(|err| format!("worker spawn failed: {}", err))?;
            workers.push(worker);
        }

        let mut throttle = AcceptThrottle::new(
            shared.cfg.throttle_window(),
            shared.cfg.throttle_max_per_ip,
        );
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let mut last_sweep = Instant::now();

        println!("ashfall: gate listening on {}", self.local_addr);
        logging::log_game(&format!("gate listening on {}", self.local_addr));

        while shared.control.is_running() {
            if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(format!("poll failed: {}", err));
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept_ready(&shared, &mut self.listener, &mut throttle),
                    WAKER_TOKEN => {}
                    token => {
                        if let Some(entry) = shared.conn(token.0 as u64) {
                            if event.is_readable() {
                                entry.readable.store(true, Ordering::SeqCst);
                            }
                            if event.is_writable() {
                                entry.writable.store(true, Ordering::SeqCst);
                            }
                            entry.schedule(&shared);
                        }
                    }
                }
            }
            if last_sweep.elapsed() >= SWEEP_INTERVAL {
                last_sweep = Instant::now();
                for entry in shared.snapshot() {
                    if entry.state_tag.load(Ordering::SeqCst) != SessionState::Closed.tag() {
                        entry.schedule(&shared);
                    }
                }
            }
        }

        let exit = shared.control.exit_reason();
        println!("ashfall: gate stopping");
        logging::log_game("gate stopping, draining sessions");

        for entry in shared.snapshot() {
            entry.push_post(Post::Kick(CloseReason::ServerShutdown));
            entry.schedule(&shared);
        }
        let drain_deadline = Instant::now() + shared.cfg.drain_timeout() + SHUTDOWN_GRACE;
        while shared.active_sessions() > 0 && Instant::now() < drain_deadline {
            if let Err(err) = poll.poll(&mut events, Some(Duration::from_millis(50))) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                break;
            }
            for event in events.iter() {
                if let Some(entry) = shared.conn(event.token().0 as u64) {
                    if event.is_writable() {
                        entry.writable.store(true, Ordering::SeqCst);
                    }
                    entry.schedule(&shared);
                }
            }
            for entry in shared.snapshot() {
                entry.schedule(&shared);
            }
        }
        for entry in shared.snapshot() {
            entry.push_post(Post::ForceClose);
            entry.schedule(&shared);
        }
        let force_deadline = Instant::now() + SHUTDOWN_GRACE;
        while shared.active_sessions() > 0 && Instant::now() < force_deadline {
            thread::sleep(Duration::from_millis(10));
        }

        for _ in &workers {
            let _ = shared.jobs.send(Job::Exit);
        }
        for worker in workers {
            let _ = worker.join();
        }
        logging::log_game("gate stopped");
        Ok(exit)
    }
}

fn accept_ready(
    shared: &Arc<GateShared>,
    listener: &mut TcpListener,
    throttle: &mut AcceptThrottle,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                if !throttle.allow(peer.ip(), Instant::now()) {
                    logging::log_net(&format!("throttled connection from {peer}"));
                    continue;
                }
                if shared.active_sessions() >= shared.cfg.session_cap {
                    logging::log_net(&format!("session cap reached, refusing {peer}"));
                    continue;
                }
                let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
                let token = Token(id as usize);
                if let Err(err) =
                    shared
                        .poll_registry
                        .register(&mut stream, token, Interest::READABLE)
                {
                    logging::log_error(&format!("register failed for {peer}: {err}"));
                    continue;
                }
                let nonce = id ^ unix_millis().rotate_left(17);
                let trace = PacketTrace::new(shared.root.as_deref(), id, peer);
                let entry = Arc::new(ConnEntry::new(
                    id,
                    token,
                    stream,
                    peer,
                    nonce,
                    &shared.cfg,
                    trace,
                ));
                shared.insert(entry);
                println!("ashfall: session {} connected from {}", id, peer);
                logging::log_net(&format!("session {id} accepted from {peer}"));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) => {
                logging::log_error(&format!("accept failed: {err}"));
                break;
            }
        }
    }
}

fn run_worker(shared: Arc<GateShared>, jobs: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let receiver = match jobs.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            receiver.recv()
        };
        match job {
            Ok(Job::Service(entry)) => entry.gate.service(|| process(&shared, &entry)),
            Ok(Job::Exit) | Err(_) => return,
        }
    }
}

/// One full service pass over a claimed connection: external posts,
/// socket reads and dispatch, periodic duties, flush, teardown.
fn process(shared: &GateShared, entry: &Arc<ConnEntry>) {
    let posts = entry.take_posts();
    let mut guard = match entry.inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let inner = &mut *guard;
    if inner.session.state() == SessionState::Closed {
        return;
    }

    for post in posts {
        match post {
            Post::Frame(body) => {
                if !matches!(
                    inner.session.state(),
                    SessionState::Disconnecting | SessionState::Closed
                ) {
                    enqueue_body(shared, entry, inner, &body);
                }
            }
            Post::AuthVerdict(outcome) => {
                let actions = inner
                    .session
                    .apply_auth_outcome(outcome, shared.registry.table());
                run_actions(shared, entry, inner, actions);
            }
            Post::Kick(reason) => start_close(shared, entry, inner, reason),
            Post::ForceClose => {
                start_close(shared, entry, inner, CloseReason::ServerShutdown);
                inner.drain_deadline = Some(Instant::now());
            }
        }
    }

    if entry.readable.swap(false, Ordering::SeqCst) {
        read_ready(shared, entry, inner);
    }
    entry.writable.swap(false, Ordering::SeqCst);

    if !matches!(
        inner.session.state(),
        SessionState::Disconnecting | SessionState::Closed
    ) {
        let actions = inner.session.tick(
            Instant::now(),
            shared.cfg.idle_timeout(),
            shared.cfg.idle_warning_after(),
            shared.cfg.auth_timeout(),
            shared.registry.table(),
        );
        run_actions(shared, entry, inner, actions);
    }

    flush_ready(shared, entry, inner);
    maybe_finalize(shared, entry, inner);
    entry
        .state_tag
        .store(inner.session.state().tag(), Ordering::SeqCst);
}

fn read_ready(shared: &GateShared, entry: &Arc<ConnEntry>, inner: &mut ConnInner) {
    if matches!(
        inner.session.state(),
        SessionState::Disconnecting | SessionState::Closed
    ) {
        return;
    }
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match inner.stream.read(&mut chunk) {
            Ok(0) => {
                start_close(shared, entry, inner, CloseReason::PeerClosed);
                return;
            }
            Ok(read) => {
                inner.decoder.feed(&chunk[..read]);
                if !drain_frames(shared, entry, inner) {
                    return;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                start_close(shared, entry, inner, CloseReason::IoError(err.to_string()));
                return;
            }
        }
    }
}

/// Decodes and dispatches every complete frame in the receive buffer.
/// Returns false once the session has started closing.
fn drain_frames(shared: &GateShared, entry: &Arc<ConnEntry>, inner: &mut ConnInner) -> bool {
    loop {
        if matches!(
            inner.session.state(),
            SessionState::Disconnecting | SessionState::Closed
        ) {
            return false;
        }
        match inner.decoder.next_frame(inner.recv_cipher.as_mut()) {
            Ok(Some(body)) => dispatch_frame(shared, entry, inner, body),
            Ok(None) => return true,
            Err(err) => {
                start_close(
                    shared,
                    entry,
                    inner,
                    CloseReason::MalformedFrame(err.to_string()),
                );
                return false;
            }
        }
    }
}

enum Dispatch {
    Actions(Vec<HandlerAction>),
    Discard,
    Malformed(String),
}

fn dispatch_frame(shared: &GateShared, entry: &Arc<ConnEntry>, inner: &mut ConnInner, body: Vec<u8>) {
    if let Some(trace) = inner.trace.as_mut() {
        trace.record_in(&body);
    }
    let registry = Arc::clone(&shared.registry);
    let session = &mut inner.session;
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut reader = PacketReader::new(&body);
        match registry.resolve(&mut reader) {
            Ok(Resolution::Handler(binding)) => match (binding.decode)(&mut reader) {
                Ok(packet) => Dispatch::Actions(session.handle_packet(packet, registry.table())),
                Err(detail) => Dispatch::Malformed(detail),
            },
            Ok(Resolution::Unknown { opcode, sub_opcode }) => {
                match sub_opcode {
                    Some(sub) => logging::log_net(&format!(
                        "session {} unknown opcode 0x{opcode:02x}/0x{sub:04x}, packet discarded",
                        session.id
                    )),
                    None => logging::log_net(&format!(
                        "session {} unknown opcode 0x{opcode:02x}, packet discarded",
                        session.id
                    )),
                }
                Dispatch::Discard
            }
            Err(detail) => Dispatch::Malformed(detail),
        }
    }));
    match outcome {
        Ok(Dispatch::Actions(actions)) => run_actions(shared, entry, inner, actions),
        Ok(Dispatch::Discard) => {}
        Ok(Dispatch::Malformed(detail)) => {
            start_close(shared, entry, inner, CloseReason::MalformedPacket(detail));
        }
        Err(payload) => {
            let detail = panic_message(payload);
            logging::log_error(&format!("session {} handler fault: {detail}", entry.id));
            start_close(shared, entry, inner, CloseReason::HandlerFault(detail));
        }
    }
}

fn run_actions(
    shared: &GateShared,
    entry: &Arc<ConnEntry>,
    inner: &mut ConnInner,
    actions: Vec<HandlerAction>,
) {
    for action in actions {
        match action {
            HandlerAction::Send(body) => enqueue_body(shared, entry, inner, &body),
            HandlerAction::ArmCipher { half } => {
                inner.recv_cipher = Some(SessionCipher::from_handshake(&half));
                inner.send_cipher = Some(SessionCipher::from_handshake(&half));
                logging::log_net(&format!("session {} cipher armed", entry.id));
            }
            HandlerAction::BeginAuth { account, key } => {
                logging::log_net(&format!(
                    "session {} auth attempt account='{}' key={}",
                    entry.id,
                    account,
                    key.encoded()
                ));
                println!(
                    "ashfall: session {} auth attempt account='{}'",
                    entry.id, account
                );
                let Some(sink) = shared.auth_sink() else {
                    start_close(shared, entry, inner, CloseReason::AuthUnavailable);
                    continue;
                };
                let request = AuthRequest {
                    session_id: entry.id,
                    account,
                    key,
                };
                let reply = AuthReply::new(entry.id, sink);
                shared.auth.begin(request, reply);
            }
            HandlerAction::EnterWorld { player_id } => {
                enter_world(shared, entry, inner, player_id);
            }
            HandlerAction::BroadcastSay { channel, text } => {
                let speaker = inner
                    .session
                    .player_name()
                    .unwrap_or("unknown")
                    .to_string();
                let body = Arc::new(build_chat_say(
                    shared.registry.table(),
                    &speaker,
                    channel,
                    &text,
                ));
                let delivered = shared.world.broadcast(body, None);
                logging::log_net(&format!(
                    "session {} say on channel {} delivered to {} sessions",
                    entry.id, channel, delivered
                ));
            }
            HandlerAction::RespondWho => {
                let names = shared.world.online_names();
                let body = build_ex_who_response(shared.registry.table(), &names);
                enqueue_body(shared, entry, inner, &body);
            }
            HandlerAction::Close(reason) => start_close(shared, entry, inner, reason),
        }
    }
}

fn enter_world(shared: &GateShared, entry: &Arc<ConnEntry>, inner: &mut ConnInner, player_id: u32) {
    let Some(roster_entry) = inner
        .session
        .roster()
        .iter()
        .find(|candidate| candidate.player_id.0 == player_id)
        .cloned()
    else {
        start_close(
            shared,
            entry,
            inner,
            CloseReason::ProtocolViolation(format!("player {player_id} is not on the roster")),
        );
        return;
    };
    let record = PlayerRecord {
        id: roster_entry.player_id,
        name: roster_entry.name.clone(),
        account: inner.session.account.clone().unwrap_or_default(),
    };
    let outcome = shared.world.register(record.clone(), entry.id);
    match inner.session.enter_world(outcome.handle, roster_entry.name) {
        Ok(()) => {
            let body = build_enter_world(shared.registry.table(), &record);
            enqueue_body(shared, entry, inner, &body);
            println!(
                "ashfall: session {} entered world as player {} '{}'",
                entry.id, record.id, record.name
            );
            logging::log_game(&format!(
                "player {} '{}' entered world (session {})",
                record.id, record.name, entry.id
            ));
        }
        Err(detail) => {
            shared.world.deregister(outcome.handle);
            start_close(shared, entry, inner, CloseReason::ProtocolViolation(detail));
        }
    }
}

fn enqueue_body(shared: &GateShared, entry: &ConnEntry, inner: &mut ConnInner, body: &[u8]) {
    if matches!(
        inner.session.state(),
        SessionState::Disconnecting | SessionState::Closed
    ) {
        return;
    }
    if !inner.outbound.has_room(body.len() + FRAME_HEADER_BYTES) {
        logging::log_net(&format!(
            "session {} outbound ceiling hit ({} frames, {} bytes queued)",
            entry.id,
            inner.outbound.len(),
            inner.outbound.queued_bytes()
        ));
        start_close(shared, entry, inner, CloseReason::SlowConsumer);
        return;
    }
    match encode_frame(body, inner.send_cipher.as_mut(), shared.cfg.max_frame_bytes) {
        Ok(wire) => {
            if let Some(trace) = inner.trace.as_mut() {
                trace.record_out(body);
            }
            if inner.outbound.push(wire).is_err() {
                start_close(shared, entry, inner, CloseReason::SlowConsumer);
            }
        }
        Err(err) => {
            logging::log_error(&format!(
                "session {} dropped outbound packet: {err}",
                entry.id
            ));
        }
    }
}

fn start_close(shared: &GateShared, entry: &ConnEntry, inner: &mut ConnInner, reason: CloseReason) {
    let notice = reason.notice_code();
    let detail = reason.describe();
    if !inner.session.begin_disconnect(reason) {
        return;
    }
    logging::log_net(&format!(
        "session {} ({}) closing: {}",
        entry.id, inner.session.peer, detail
    ));
    println!("ashfall: session {} closing: {}", entry.id, detail);
    if let Some(code) = notice {
        let body = build_disconnect_notice(shared.registry.table(), code);
        if let Ok(wire) = encode_frame(&body, inner.send_cipher.as_mut(), shared.cfg.max_frame_bytes)
        {
            if let Some(trace) = inner.trace.as_mut() {
                trace.record_out(&body);
            }
            // best effort: a slow consumer's queue may already be full
            let _ = inner.outbound.push(wire);
        }
    }
    inner.drain_deadline = Some(Instant::now() + shared.cfg.drain_timeout());
}

fn flush_ready(shared: &GateShared, entry: &ConnEntry, inner: &mut ConnInner) {
    if inner.session.state() == SessionState::Closed {
        return;
    }
    match flush_queue(&mut inner.outbound, &mut inner.stream) {
        FlushOutcome::Drained => set_interest(shared, inner, entry.token, false),
        FlushOutcome::Pending => set_interest(shared, inner, entry.token, true),
        FlushOutcome::PeerClosed => {
            if inner.session.state() == SessionState::Disconnecting {
                inner.drain_deadline = Some(Instant::now());
            } else {
                start_close(shared, entry, inner, CloseReason::PeerClosed);
            }
        }
        FlushOutcome::Failed(err) => {
            if inner.session.state() == SessionState::Disconnecting {
                inner.drain_deadline = Some(Instant::now());
            } else {
                start_close(shared, entry, inner, CloseReason::IoError(err.to_string()));
            }
        }
    }
}

fn set_interest(shared: &GateShared, inner: &mut ConnInner, token: Token, want_write: bool) {
    let desired = if want_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if inner.interest != desired
        && shared
            .poll_registry
            .reregister(&mut inner.stream, token, desired)
            .is_ok()
    {
        inner.interest = desired;
    }
}

fn maybe_finalize(shared: &GateShared, entry: &ConnEntry, inner: &mut ConnInner) {
    if inner.session.state() != SessionState::Disconnecting {
        return;
    }
    let deadline_passed = inner
        .drain_deadline
        .map(|deadline| Instant::now() >= deadline)
        .unwrap_or(true);
    if !inner.outbound.is_empty() && !deadline_passed {
        return;
    }
    if let Some(handle) = inner.session.player() {
        shared.world.deregister(handle);
        logging::log_game(&format!(
            "player {} left world (session {})",
            handle.player_id, entry.id
        ));
    }
    let _ = shared.poll_registry.deregister(&mut inner.stream);
    let _ = inner.stream.shutdown(std::net::Shutdown::Both);
    inner.session.mark_closed();
    shared.remove(entry.id);
    logging::log_net(&format!("session {} closed", entry.id));
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
