//! Per-IP accept throttle. A bounded LRU of recent attempt windows keeps
//! one noisy address from monopolizing the acceptor without tracking
//! every peer ever seen.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

const TRACKED_PEERS: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct AttemptWindow {
    started: Instant,
    attempts: usize,
}

pub struct AcceptThrottle {
    windows: LruCache<IpAddr, AttemptWindow>,
    window: Duration,
    max_per_window: usize,
}

impl AcceptThrottle {
    pub fn new(window: Duration, max_per_window: usize) -> Self {
        let capacity = NonZeroUsize::new(TRACKED_PEERS).expect("nonzero capacity");
        Self {
            windows: LruCache::new(capacity),
            window,
            max_per_window: max_per_window.max(1),
        }
    }

    /// Records one attempt and reports whether it is allowed.
    pub fn allow(&mut self, ip: IpAddr, now: Instant) -> bool {
        let window = self.window;
        let entry = self.windows.get_or_insert_mut(ip, || AttemptWindow {
            started: now,
            attempts: 0,
        });
        if now.duration_since(entry.started) >= window {
            entry.started = now;
            entry.attempts = 0;
        }
        entry.attempts += 1;
        entry.attempts <= self.max_per_window
    }
}
