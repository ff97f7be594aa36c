//! Shared world registry: the one structure many sessions mutate
//! concurrently. It owns the player-id → session mapping and keeps its
//! lock private; the net layer only sees `register`/`deregister`/lookup
//! and broadcast. The lock is never held across a handler, only across
//! map operations — deliveries happen after it is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::entities::player::{PlayerId, PlayerRecord};
use crate::telemetry::logging;

/// Proof of registration handed back to the session. Deregistration is
/// keyed on both ids so a stale guard from a kicked session cannot evict
/// its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerHandle {
    pub player_id: PlayerId,
    pub session_id: u64,
}

/// Delivery seam back into the session gate. The registry never touches
/// sockets or queues directly.
pub trait SessionPoster: Send + Sync {
    fn deliver(&self, session_id: u64, body: Arc<Vec<u8>>);
    fn kick_duplicate(&self, session_id: u64);
}

#[derive(Debug)]
pub struct RegisterOutcome {
    pub handle: PlayerHandle,
    /// Session that was kicked to make room, if the id was already online.
    pub replaced_session: Option<u64>,
}

struct WorldEntry {
    record: PlayerRecord,
    session_id: u64,
}

#[derive(Default)]
pub struct WorldRegistry {
    players: Mutex<HashMap<PlayerId, WorldEntry>>,
    poster: OnceLock<Arc<dyn SessionPoster>>,
}

impl WorldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires the registry to the gate. Called once at startup, before any
    /// connection is accepted.
    pub fn attach_gate(&self, poster: Arc<dyn SessionPoster>) -> Result<(), String> {
        self.poster
            .set(poster)
            .map_err(|_| "world registry already attached to a gate".to_string())
    }

    /// Puts a player online. A duplicate login kicks the older session;
    /// the newer one always wins.
    pub fn register(&self, record: PlayerRecord, session_id: u64) -> RegisterOutcome {
        let player_id = record.id;
        let replaced_session = {
            let mut players = self.lock_players();
            let previous = players.insert(
                player_id,
                WorldEntry {
                    record,
                    session_id,
                },
            );
            previous.map(|entry| entry.session_id)
        };
        if let Some(old_session) = replaced_session {
            logging::log_game(&format!(
                "player {player_id} relogged, kicking session {old_session}"
            ));
            if let Some(poster) = self.poster.get() {
                poster.kick_duplicate(old_session);
            }
        }
        RegisterOutcome {
            handle: PlayerHandle {
                player_id,
                session_id,
            },
            replaced_session,
        }
    }

    /// Takes a player offline. A handle from a kicked session is stale
    /// and leaves the newer registration untouched.
    pub fn deregister(&self, handle: PlayerHandle) -> bool {
        let mut players = self.lock_players();
        match players.get(&handle.player_id) {
            Some(entry) if entry.session_id == handle.session_id => {
                players.remove(&handle.player_id);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, player_id: PlayerId) -> Option<PlayerRecord> {
        self.lock_players()
            .get(&player_id)
            .map(|entry| entry.record.clone())
    }

    pub fn online_count(&self) -> usize {
        self.lock_players().len()
    }

    pub fn online_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock_players()
            .values()
            .map(|entry| entry.record.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Queues one prebuilt body to every online session. The body is
    /// shared, not copied; per-connection framing happens at each gate.
    pub fn broadcast(&self, body: Arc<Vec<u8>>, except: Option<u64>) -> usize {
        let recipients: Vec<u64> = {
            self.lock_players()
                .values()
                .map(|entry| entry.session_id)
                .filter(|session_id| Some(*session_id) != except)
                .collect()
        };
        let Some(poster) = self.poster.get() else {
            return 0;
        };
        for session_id in &recipients {
            poster.deliver(*session_id, Arc::clone(&body));
        }
        recipients.len()
    }

    fn lock_players(&self) -> std::sync::MutexGuard<'_, HashMap<PlayerId, WorldEntry>> {
        match self.players.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingPoster {
        delivered: StdMutex<Vec<(u64, Arc<Vec<u8>>)>>,
        kicked: StdMutex<Vec<u64>>,
    }

    impl SessionPoster for RecordingPoster {
        fn deliver(&self, session_id: u64, body: Arc<Vec<u8>>) {
            self.delivered
                .lock()
                .expect("poster lock")
                .push((session_id, body));
        }

        fn kick_duplicate(&self, session_id: u64) {
            self.kicked.lock().expect("poster lock").push(session_id);
        }
    }

    fn record(id: u32, name: &str) -> PlayerRecord {
        PlayerRecord {
            id: PlayerId(id),
            name: name.to_string(),
            account: "aria".to_string(),
        }
    }

    fn wired_registry() -> (WorldRegistry, Arc<RecordingPoster>) {
        let registry = WorldRegistry::new();
        let poster = Arc::new(RecordingPoster::default());
        registry
            .attach_gate(poster.clone() as Arc<dyn SessionPoster>)
            .expect("attach");
        (registry, poster)
    }

    #[test]
    fn register_and_lookup() {
        let (registry, _poster) = wired_registry();
        let outcome = registry.register(record(42, "Kael"), 1);
        assert_eq!(outcome.handle.player_id, PlayerId(42));
        assert_eq!(outcome.replaced_session, None);
        assert_eq!(registry.online_count(), 1);
        assert_eq!(registry.lookup(PlayerId(42)).expect("record").name, "Kael");
    }

    #[test]
    fn duplicate_login_kicks_older_session() {
        let (registry, poster) = wired_registry();
        registry.register(record(42, "Kael"), 1);
        let outcome = registry.register(record(42, "Kael"), 2);
        assert_eq!(outcome.replaced_session, Some(1));
        assert_eq!(*poster.kicked.lock().expect("lock"), vec![1]);
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn stale_handle_cannot_evict_replacement() {
        let (registry, _poster) = wired_registry();
        let old = registry.register(record(42, "Kael"), 1).handle;
        registry.register(record(42, "Kael"), 2);
        assert!(!registry.deregister(old));
        assert_eq!(registry.online_count(), 1);
        assert!(registry.deregister(PlayerHandle {
            player_id: PlayerId(42),
            session_id: 2,
        }));
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn broadcast_skips_excepted_session_and_shares_body() {
        let (registry, poster) = wired_registry();
        registry.register(record(1, "Kael"), 10);
        registry.register(record(2, "Mira"), 11);
        registry.register(record(3, "Brom"), 12);
        let body = Arc::new(vec![0xaa, 0xbb]);
        let sent = registry.broadcast(Arc::clone(&body), Some(11));
        assert_eq!(sent, 2);
        let delivered = poster.delivered.lock().expect("lock");
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().all(|(id, _)| *id != 11));
        assert!(delivered.iter().all(|(_, b)| Arc::ptr_eq(b, &body)));
    }

    #[test]
    fn attach_gate_is_once() {
        let (registry, poster) = wired_registry();
        assert!(registry
            .attach_gate(poster as Arc<dyn SessionPoster>)
            .is_err());
    }

    #[test]
    fn online_names_are_sorted() {
        let (registry, _poster) = wired_registry();
        registry.register(record(1, "Mira"), 10);
        registry.register(record(2, "Kael"), 11);
        assert_eq!(registry.online_names(), vec!["Kael", "Mira"]);
    }
}
