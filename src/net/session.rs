//! Per-connection session: lifecycle state machine, the state × packet
//! handler matrix, and the ordered outbound queue with its slow-consumer
//! ceilings. Handlers never touch sockets or shared state directly; they
//! return explicit actions for the gate to execute, which keeps every
//! transition unit-testable.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::entities::player::RosterEntry;
use crate::net::auth::{AuthOutcome, SessionKey};
use crate::net::cipher::{SessionCipher, HANDSHAKE_KEY_BYTES};
use crate::net::client_packets::ClientPacket;
use crate::net::opcodes::OpcodeTable;
use crate::net::server_packets::{
    build_auth_fail, build_auth_ok, build_character_roster, build_key_init, build_pong,
    build_system_message, DisconnectCode,
};
use crate::world::registry::PlayerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticating,
    Authenticated,
    InWorld,
    Disconnecting,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::InWorld => "in_world",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Closed => "closed",
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            SessionState::Connected => 0,
            SessionState::Authenticating => 1,
            SessionState::Authenticated => 2,
            SessionState::InWorld => 3,
            SessionState::Disconnecting => 4,
            SessionState::Closed => 5,
        }
    }
}

/// Why a connection is going away. Every variant is logged; some also
/// earn the client a final disconnect notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    MalformedFrame(String),
    MalformedPacket(String),
    ProtocolViolation(String),
    AuthRejected(String),
    AuthUnavailable,
    SlowConsumer,
    IdleTimeout,
    Logout,
    DuplicateLogin,
    IoError(String),
    PeerClosed,
    ServerShutdown,
    HandlerFault(String),
}

impl CloseReason {
    pub fn describe(&self) -> String {
        match self {
            CloseReason::MalformedFrame(detail) => format!("malformed frame: {detail}"),
            CloseReason::MalformedPacket(detail) => format!("malformed packet: {detail}"),
            CloseReason::ProtocolViolation(detail) => format!("protocol violation: {detail}"),
            CloseReason::AuthRejected(reason) => format!("auth rejected: {reason}"),
            CloseReason::AuthUnavailable => "auth service unreachable".to_string(),
            CloseReason::SlowConsumer => "outbound queue ceiling exceeded".to_string(),
            CloseReason::IdleTimeout => "idle timeout".to_string(),
            CloseReason::Logout => "logout".to_string(),
            CloseReason::DuplicateLogin => "duplicate login".to_string(),
            CloseReason::IoError(detail) => format!("io error: {detail}"),
            CloseReason::PeerClosed => "peer closed".to_string(),
            CloseReason::ServerShutdown => "server shutdown".to_string(),
            CloseReason::HandlerFault(detail) => format!("handler fault: {detail}"),
        }
    }

    /// The notice to flush before the socket closes, when one makes sense.
    pub fn notice_code(&self) -> Option<DisconnectCode> {
        match self {
            CloseReason::MalformedFrame(_)
            | CloseReason::MalformedPacket(_)
            | CloseReason::ProtocolViolation(_) => Some(DisconnectCode::ProtocolViolation),
            CloseReason::AuthRejected(_) => Some(DisconnectCode::AuthFailed),
            CloseReason::AuthUnavailable => Some(DisconnectCode::AuthUnavailable),
            CloseReason::SlowConsumer => Some(DisconnectCode::SlowConsumer),
            CloseReason::IdleTimeout => Some(DisconnectCode::IdleTimeout),
            CloseReason::DuplicateLogin => Some(DisconnectCode::DuplicateLogin),
            CloseReason::ServerShutdown => Some(DisconnectCode::ServerShutdown),
            CloseReason::Logout
            | CloseReason::IoError(_)
            | CloseReason::PeerClosed
            | CloseReason::HandlerFault(_) => None,
        }
    }
}

/// Effects a handler asks the gate to carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerAction {
    Send(Vec<u8>),
    ArmCipher { half: [u8; HANDSHAKE_KEY_BYTES] },
    BeginAuth { account: String, key: SessionKey },
    EnterWorld { player_id: u32 },
    BroadcastSay { channel: u8, text: String },
    RespondWho,
    Close(CloseReason),
}

#[derive(Debug)]
struct QueuedFrame {
    bytes: Vec<u8>,
    sent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOverflow {
    pub queued_messages: usize,
    pub queued_bytes: usize,
}

/// FIFO of encoded frames awaiting the socket. Ceilings bound both the
/// message count and the byte total; hitting either is a slow-consumer
/// condition and the connection must close rather than buffer on.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<QueuedFrame>,
    queued_bytes: usize,
    ceiling_messages: usize,
    ceiling_bytes: usize,
}

impl OutboundQueue {
    pub fn new(ceiling_messages: usize, ceiling_bytes: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            queued_bytes: 0,
            ceiling_messages,
            ceiling_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Whether one more frame of `additional_bytes` fits under both
    /// ceilings. Checked before encoding so a refused frame never
    /// advances the send cipher.
    pub fn has_room(&self, additional_bytes: usize) -> bool {
        self.frames.len() < self.ceiling_messages
            && self.queued_bytes + additional_bytes <= self.ceiling_bytes
    }

    pub fn push(&mut self, bytes: Vec<u8>) -> Result<(), QueueOverflow> {
        if self.frames.len() >= self.ceiling_messages
            || self.queued_bytes + bytes.len() > self.ceiling_bytes
        {
            return Err(QueueOverflow {
                queued_messages: self.frames.len(),
                queued_bytes: self.queued_bytes,
            });
        }
        self.queued_bytes += bytes.len();
        self.frames.push_back(QueuedFrame { bytes, sent: 0 });
        Ok(())
    }
}

#[derive(Debug)]
pub enum FlushOutcome {
    /// Everything queued has hit the socket.
    Drained,
    /// The socket is full; frames remain queued in order.
    Pending,
    PeerClosed,
    Failed(std::io::Error),
}

/// Writes queued frames front-first, preserving submission order across
/// partial writes.
pub fn flush_queue<W: std::io::Write>(queue: &mut OutboundQueue, writer: &mut W) -> FlushOutcome {
    while let Some(front) = queue.frames.front_mut() {
        match writer.write(&front.bytes[front.sent..]) {
            Ok(0) => return FlushOutcome::PeerClosed,
            Ok(written) => {
                front.sent += written;
                queue.queued_bytes -= written;
                if front.sent == front.bytes.len() {
                    queue.frames.pop_front();
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return FlushOutcome::Pending
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return FlushOutcome::Failed(err),
        }
    }
    FlushOutcome::Drained
}

#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub peer: SocketAddr,
    state: SessionState,
    nonce: u64,
    pub account: Option<String>,
    roster: Vec<RosterEntry>,
    player: Option<PlayerHandle>,
    player_name: Option<String>,
    pub last_activity: Instant,
    idle_warning_sent: bool,
    auth_pending: bool,
    pub auth_started: Option<Instant>,
    close_reason: Option<CloseReason>,
}

impl Session {
    pub fn new(id: u64, peer: SocketAddr, nonce: u64) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Connected,
            nonce,
            account: None,
            roster: Vec::new(),
            player: None,
            player_name: None,
            last_activity: Instant::now(),
            idle_warning_sent: false,
            auth_pending: false,
            auth_started: None,
            close_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn player(&self) -> Option<PlayerHandle> {
        self.player
    }

    pub fn player_name(&self) -> Option<&str> {
        self.player_name.as_deref()
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.idle_warning_sent = false;
    }

    /// Enters the world. Refuses any path that has not passed through
    /// `Authenticated`; the association is fixed for the session's life.
    pub fn enter_world(&mut self, handle: PlayerHandle, name: String) -> Result<(), String> {
        if self.state != SessionState::Authenticated {
            return Err(format!(
                "cannot enter world from state {}",
                self.state.as_str()
            ));
        }
        if self.player.is_some() {
            return Err("session already owns a player".to_string());
        }
        self.player = Some(handle);
        self.player_name = Some(name);
        self.state = SessionState::InWorld;
        Ok(())
    }

    /// Starts teardown. Idempotent: only the first reason sticks.
    pub fn begin_disconnect(&mut self, reason: CloseReason) -> bool {
        if matches!(
            self.state,
            SessionState::Disconnecting | SessionState::Closed
        ) {
            return false;
        }
        self.state = SessionState::Disconnecting;
        self.close_reason = Some(reason);
        true
    }

    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Runs one inbound packet through the state × packet matrix.
    pub fn handle_packet(&mut self, packet: ClientPacket, table: &OpcodeTable) -> Vec<HandlerAction> {
        self.touch();
        match self.state {
            SessionState::Connected => self.handle_in_connected(packet, table),
            SessionState::Authenticating => self.handle_in_authenticating(packet, table),
            SessionState::Authenticated => self.handle_in_authenticated(packet, table),
            SessionState::InWorld => self.handle_in_world(packet, table),
            // teardown in progress: inbound traffic is ignored
            SessionState::Disconnecting | SessionState::Closed => Vec::new(),
        }
    }

    fn handle_in_connected(
        &mut self,
        packet: ClientPacket,
        table: &OpcodeTable,
    ) -> Vec<HandlerAction> {
        match packet {
            ClientPacket::Handshake { revision } => {
                if revision != table.revision {
                    return vec![HandlerAction::Close(CloseReason::ProtocolViolation(
                        format!(
                            "unsupported protocol revision {revision} (serving {})",
                            table.revision
                        ),
                    ))];
                }
                let half = SessionCipher::derive_handshake_half(self.nonce);
                self.state = SessionState::Authenticating;
                vec![
                    HandlerAction::Send(build_key_init(table, &half)),
                    HandlerAction::ArmCipher { half },
                ]
            }
            other => vec![HandlerAction::Close(CloseReason::ProtocolViolation(
                format!("expected handshake first, got {}", other.name()),
            ))],
        }
    }

    fn handle_in_authenticating(
        &mut self,
        packet: ClientPacket,
        table: &OpcodeTable,
    ) -> Vec<HandlerAction> {
        match packet {
            ClientPacket::AuthLogin { account, key } => {
                if self.auth_pending {
                    return vec![HandlerAction::Close(CloseReason::ProtocolViolation(
                        "credentials already submitted".to_string(),
                    ))];
                }
                self.auth_pending = true;
                self.auth_started = Some(Instant::now());
                vec![HandlerAction::BeginAuth { account, key }]
            }
            ClientPacket::Ping { echo } => vec![HandlerAction::Send(build_pong(table, echo))],
            other => vec![HandlerAction::Close(CloseReason::ProtocolViolation(
                format!("unexpected {} while authenticating", other.name()),
            ))],
        }
    }

    fn handle_in_authenticated(
        &mut self,
        packet: ClientPacket,
        table: &OpcodeTable,
    ) -> Vec<HandlerAction> {
        match packet {
            ClientPacket::RequestRoster => {
                vec![HandlerAction::Send(build_character_roster(
                    table,
                    &self.roster,
                ))]
            }
            ClientPacket::CharacterSelect { player_id } => {
                if self
                    .roster
                    .iter()
                    .any(|entry| entry.player_id.0 == player_id)
                {
                    vec![HandlerAction::EnterWorld { player_id }]
                } else {
                    vec![HandlerAction::Close(CloseReason::ProtocolViolation(
                        format!("player {player_id} is not on the account roster"),
                    ))]
                }
            }
            ClientPacket::Ping { echo } => vec![HandlerAction::Send(build_pong(table, echo))],
            ClientPacket::Logout => vec![HandlerAction::Close(CloseReason::Logout)],
            other => vec![HandlerAction::Close(CloseReason::ProtocolViolation(
                format!("unexpected {} before world entry", other.name()),
            ))],
        }
    }

    fn handle_in_world(&mut self, packet: ClientPacket, table: &OpcodeTable) -> Vec<HandlerAction> {
        match packet {
            ClientPacket::Ping { echo } => vec![HandlerAction::Send(build_pong(table, echo))],
            ClientPacket::Say { channel, text } => {
                vec![HandlerAction::BroadcastSay { channel, text }]
            }
            ClientPacket::WhoRequest => vec![HandlerAction::RespondWho],
            ClientPacket::Logout => vec![HandlerAction::Close(CloseReason::Logout)],
            other => vec![HandlerAction::Close(CloseReason::ProtocolViolation(
                format!("unexpected {} in world", other.name()),
            ))],
        }
    }

    /// Applies the login service's verdict. A verdict that arrives after
    /// teardown started is dropped.
    pub fn apply_auth_outcome(
        &mut self,
        outcome: AuthOutcome,
        table: &OpcodeTable,
    ) -> Vec<HandlerAction> {
        if self.state != SessionState::Authenticating || !self.auth_pending {
            return Vec::new();
        }
        self.auth_pending = false;
        match outcome {
            AuthOutcome::Authenticated { account, roster } => {
                self.state = SessionState::Authenticated;
                self.account = Some(account);
                self.roster = roster;
                vec![
                    HandlerAction::Send(build_auth_ok(table)),
                    HandlerAction::Send(build_character_roster(table, &self.roster)),
                ]
            }
            AuthOutcome::Rejected { reason } => vec![
                HandlerAction::Send(build_auth_fail(table, &reason)),
                HandlerAction::Close(CloseReason::AuthRejected(reason)),
            ],
            AuthOutcome::Unreachable => {
                vec![HandlerAction::Close(CloseReason::AuthUnavailable)]
            }
        }
    }

    /// Periodic sweep: idle warning, idle kick, stuck authentication.
    pub fn tick(
        &mut self,
        now: Instant,
        idle_timeout: Duration,
        idle_warning_after: Option<Duration>,
        auth_timeout: Duration,
        table: &OpcodeTable,
    ) -> Vec<HandlerAction> {
        if matches!(
            self.state,
            SessionState::Disconnecting | SessionState::Closed
        ) {
            return Vec::new();
        }
        if let Some(started) = self.auth_started {
            if self.auth_pending && now.duration_since(started) >= auth_timeout {
                return vec![HandlerAction::Close(CloseReason::AuthUnavailable)];
            }
        }
        let idle = now.duration_since(self.last_activity);
        if idle >= idle_timeout {
            return vec![HandlerAction::Close(CloseReason::IdleTimeout)];
        }
        if let Some(warn_after) = idle_warning_after {
            if !self.idle_warning_sent && warn_after < idle_timeout && idle >= warn_after {
                self.idle_warning_sent = true;
                let minutes = (idle.as_secs() / 60).max(1);
                let message = format!(
                    "You have been idle for {minutes} minutes and will be disconnected soon."
                );
                return vec![HandlerAction::Send(build_system_message(table, &message))];
            }
        }
        Vec::new()
    }
}
