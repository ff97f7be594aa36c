//! Boundary to the companion login service. The gate never blocks a
//! worker on credential checks: it hands an `AuthRequest` to the
//! `Authenticator` together with a reply handle, and the outcome comes
//! back through the session gate whenever the collaborator finishes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread;

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use serde::Deserialize;

use crate::entities::player::RosterEntry;

/// Session key pair issued by the login service at account login and
/// presented again to the game side. Compared word-for-word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKey {
    pub login_ok: [u32; 2],
    pub play_ok: [u32; 2],
}

impl SessionKey {
    pub fn is_zero(&self) -> bool {
        self.login_ok == [0, 0] && self.play_ok == [0, 0]
    }

    /// Encoded form for log lines; raw key words never reach a log file.
    pub fn encoded(&self) -> String {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&self.login_ok[0].to_le_bytes());
        bytes[4..8].copy_from_slice(&self.login_ok[1].to_le_bytes());
        bytes[8..12].copy_from_slice(&self.play_ok[0].to_le_bytes());
        bytes[12..].copy_from_slice(&self.play_ok[1].to_le_bytes());
        BASE64_ENGINE.encode(bytes)
    }
}

#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub session_id: u64,
    pub account: String,
    pub key: SessionKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated {
        account: String,
        roster: Vec<RosterEntry>,
    },
    Rejected {
        reason: String,
    },
    /// The login service could not be reached. Transient: the connection
    /// closes, the account is not penalized.
    Unreachable,
}

/// Where completions go. Implemented by the gate server; kept as a trait
/// so authenticators and their tests need nothing from the selector.
pub trait AuthSink: Send + Sync {
    fn complete(&self, session_id: u64, outcome: AuthOutcome);
}

pub struct AuthReply {
    session_id: u64,
    sink: Arc<dyn AuthSink>,
}

impl AuthReply {
    pub fn new(session_id: u64, sink: Arc<dyn AuthSink>) -> Self {
        Self { session_id, sink }
    }

    pub fn complete(self, outcome: AuthOutcome) {
        self.sink.complete(self.session_id, outcome);
    }
}

/// Credential checker. `begin` must return promptly; slow back ends wrap
/// themselves in [`DeferredAuthenticator`] so the worker pool never waits.
pub trait Authenticator: Send + Sync + 'static {
    fn begin(&self, request: AuthRequest, reply: AuthReply);
}

#[derive(Debug, Clone, Deserialize)]
struct AccountSpec {
    account: String,
    #[serde(default)]
    banned: bool,
    #[serde(default)]
    characters: Vec<RosterEntry>,
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    accounts: Vec<AccountSpec>,
}

/// In-memory credential table, loaded once at startup. Stands in for the
/// companion login service in development and in tests.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    accounts: HashMap<String, AccountSpec>,
}

impl StaticAuthenticator {
    pub fn new(specs: Vec<(String, Vec<RosterEntry>)>) -> Self {
        let accounts = specs
            .into_iter()
            .map(|(account, characters)| {
                let key = normalize_account(&account);
                (
                    key,
                    AccountSpec {
                        account,
                        banned: false,
                        characters,
                    },
                )
            })
            .collect();
        Self { accounts }
    }

    /// Reads `<root>/accounts.yml`; a missing file is not an error, the
    /// caller falls back to an empty table.
    pub fn load(root: &Path) -> Result<Option<Self>, String> {
        let path = root.join("accounts.yml");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(format!(
                    "account file read failed for {}: {}",
                    path.display(),
                    err
                ))
            }
        };
        let file: AccountsFile = serde_yaml::from_str(&text)
            .map_err(|err| format!("account file parse failed for {}: {}", path.display(), err))?;
        let accounts = file
            .accounts
            .into_iter()
            .map(|spec| (normalize_account(&spec.account), spec))
            .collect();
        Ok(Some(Self { accounts }))
    }

    fn check(&self, request: &AuthRequest) -> AuthOutcome {
        if request.key.is_zero() {
            return AuthOutcome::Rejected {
                reason: "session key missing".to_string(),
            };
        }
        match self.accounts.get(&normalize_account(&request.account)) {
            Some(spec) if spec.banned => AuthOutcome::Rejected {
                reason: "account is banished".to_string(),
            },
            Some(spec) => AuthOutcome::Authenticated {
                account: spec.account.clone(),
                roster: spec.characters.clone(),
            },
            None => AuthOutcome::Rejected {
                reason: "account unknown".to_string(),
            },
        }
    }
}

impl Authenticator for StaticAuthenticator {
    fn begin(&self, request: AuthRequest, reply: AuthReply) {
        let outcome = self.check(&request);
        reply.complete(outcome);
    }
}

fn normalize_account(account: &str) -> String {
    account.trim().to_ascii_lowercase()
}

/// Runs another authenticator on its own thread so a slow or remote back
/// end never occupies a worker. A dead back-end thread surfaces as
/// `Unreachable`, never as a hang.
pub struct DeferredAuthenticator {
    tx: Sender<(AuthRequest, AuthReply)>,
}

impl DeferredAuthenticator {
    pub fn spawn<A: Authenticator>(inner: A) -> Self {
        let (tx, rx) = channel::<(AuthRequest, AuthReply)>();
        thread::spawn(move || {
            while let Ok((request, reply)) = rx.recv() {
                inner.begin(request, reply);
            }
        });
        Self { tx }
    }
}

impl Authenticator for DeferredAuthenticator {
    fn begin(&self, request: AuthRequest, reply: AuthReply) {
        if let Err(send_err) = self.tx.send((request, reply)) {
            let (_, reply) = send_err.0;
            reply.complete(AuthOutcome::Unreachable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::player::PlayerId;
    use std::sync::Mutex;

    struct CaptureSink {
        outcomes: Mutex<Vec<(u64, AuthOutcome)>>,
    }

    impl CaptureSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(u64, AuthOutcome)> {
            std::mem::take(&mut *self.outcomes.lock().expect("sink lock"))
        }
    }

    impl AuthSink for CaptureSink {
        fn complete(&self, session_id: u64, outcome: AuthOutcome) {
            self.outcomes
                .lock()
                .expect("sink lock")
                .push((session_id, outcome));
        }
    }

    fn request(account: &str) -> AuthRequest {
        AuthRequest {
            session_id: 9,
            account: account.to_string(),
            key: SessionKey {
                login_ok: [1, 2],
                play_ok: [3, 4],
            },
        }
    }

    fn roster() -> Vec<RosterEntry> {
        vec![RosterEntry {
            player_id: PlayerId(42),
            name: "Kael".to_string(),
            level: 12,
        }]
    }

    #[test]
    fn known_account_authenticates_with_roster() {
        let auth = StaticAuthenticator::new(vec![("Aria".to_string(), roster())]);
        let sink = CaptureSink::new();
        auth.begin(request("aria"), AuthReply::new(9, sink.clone()));
        let outcomes = sink.take();
        assert_eq!(outcomes.len(), 1);
        match &outcomes[0].1 {
            AuthOutcome::Authenticated { account, roster } => {
                assert_eq!(account, "Aria");
                assert_eq!(roster.len(), 1);
                assert_eq!(roster[0].player_id, PlayerId(42));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn unknown_account_is_rejected() {
        let auth = StaticAuthenticator::default();
        let sink = CaptureSink::new();
        auth.begin(request("ghost"), AuthReply::new(9, sink.clone()));
        assert!(matches!(
            sink.take()[0].1,
            AuthOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn zero_session_key_is_rejected() {
        let auth = StaticAuthenticator::new(vec![("aria".to_string(), roster())]);
        let sink = CaptureSink::new();
        let mut request = request("aria");
        request.key = SessionKey {
            login_ok: [0, 0],
            play_ok: [0, 0],
        };
        auth.begin(request, AuthReply::new(9, sink.clone()));
        assert!(matches!(sink.take()[0].1, AuthOutcome::Rejected { .. }));
    }

    #[test]
    fn deferred_wrapper_completes_off_thread() {
        let auth = DeferredAuthenticator::spawn(StaticAuthenticator::new(vec![(
            "aria".to_string(),
            roster(),
        )]));
        let sink = CaptureSink::new();
        auth.begin(request("aria"), AuthReply::new(7, sink.clone()));
        // completion is asynchronous; poll briefly
        for _ in 0..100 {
            if !sink.outcomes.lock().expect("sink lock").is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let outcomes = sink.take();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, 7);
    }

    #[test]
    fn accounts_file_parses() {
        let file: AccountsFile = serde_yaml::from_str(
            "accounts:\n  - account: aria\n    characters:\n      - player_id: 42\n        name: Kael\n        level: 12\n  - account: brom\n    banned: true\n",
        )
        .expect("accounts");
        assert_eq!(file.accounts.len(), 2);
        assert!(file.accounts[1].banned);
    }

    #[test]
    fn session_key_encoding_is_stable() {
        let key = SessionKey {
            login_ok: [1, 2],
            play_ok: [3, 4],
        };
        assert_eq!(key.encoded(), key.encoded());
        assert!(!key.encoded().contains(' '));
    }
}
