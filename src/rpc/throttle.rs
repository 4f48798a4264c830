//! Per-client packet throttling.

use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

const WINDOW: Duration = Duration::from_secs(60);

/// Protects against spammy clients by capping the packets accepted from a
/// single source IP per minute. Only the most recently seen hosts are
/// remembered, in an LRU.
#[derive(Debug)]
pub struct ClientThrottle {
    clients: LruCache<Ipv4Addr, ClientWindow>,
    per_minute_limit: usize,
}

#[derive(Debug)]
struct ClientWindow {
    started: Instant,
    packets: usize,
}

impl ClientThrottle {
    pub fn new(per_minute_limit: usize, tracked_clients: usize) -> ClientThrottle {
        ClientThrottle {
            clients: LruCache::new(
                NonZeroUsize::new(tracked_clients.max(1)).expect("tracked clients is non-zero"),
            ),
            per_minute_limit,
        }
    }

    /// Account one packet from `ip` and return whether it should be
    /// processed. False means the client exceeded its per-minute budget.
    pub fn allow(&mut self, ip: Ipv4Addr) -> bool {
        let now = Instant::now();
        let window = self.clients.get_or_insert_mut(ip, || ClientWindow {
            started: now,
            packets: 0,
        });

        if now.duration_since(window.started) > WINDOW {
            window.started = now;
            window.packets = 0;
        }
        window.packets += 1;
        window.packets <= self.per_minute_limit
    }
}
