//! Per-client-IP rate and connection limiting.
//!
//! A keyed token bucket (sustained rate + burst) and a concurrent
//! connection counter, both keyed by client IP and applied before the
//! dispatcher touches the request. Admin hosts and the health path bypass
//! both — the operator surface must stay responsive while a user app is
//! under attack. Idle entries are garbage-collected on a background
//! cadence.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use tracing::debug;

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Entries idle longer than this are swept.
const IDLE_TTL: Duration = Duration::from_secs(180);

/// The limiter tables.
pub struct Limits {
    limiter: RwLock<Arc<KeyedLimiter>>,
    connections: Arc<DashMap<IpAddr, u32>>,
    last_seen: DashMap<IpAddr, Instant>,
    max_connections: RwLock<u32>,
    burst: RwLock<u32>,
}

impl Limits {
    #[must_use]
    pub fn new(rate_per_second: u32, burst: u32, max_connections: u32) -> Self {
        Self {
            limiter: RwLock::new(Arc::new(build_limiter(rate_per_second, burst))),
            connections: Arc::new(DashMap::new()),
            last_seen: DashMap::new(),
            max_connections: RwLock::new(max_connections.max(1)),
            burst: RwLock::new(burst.max(1)),
        }
    }

    /// Replace the tunables (recalibration). Existing buckets reset.
    pub fn reconfigure(&self, rate_per_second: u32, burst: u32, max_connections: u32) {
        if let Ok(mut guard) = self.limiter.write() {
            *guard = Arc::new(build_limiter(rate_per_second, burst));
        }
        if let Ok(mut guard) = self.max_connections.write() {
            *guard = max_connections.max(1);
        }
        if let Ok(mut guard) = self.burst.write() {
            *guard = burst.max(1);
        }
    }

    /// Configured burst (for the `X-RateLimit-Limit` header).
    #[must_use]
    pub fn burst(&self) -> u32 {
        self.burst.read().map(|g| *g).unwrap_or(1)
    }

    /// Take one token from the IP's bucket. `false` means 429.
    #[must_use]
    pub fn check_rate(&self, ip: IpAddr) -> bool {
        self.last_seen.insert(ip, Instant::now());
        let limiter = match self.limiter.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(_) => return true,
        };
        limiter.check_key(&ip).is_ok()
    }

    /// Claim a connection slot for the IP. `None` means the cap is hit
    /// (503). The slot is released when the guard drops.
    #[must_use]
    pub fn acquire_connection(&self, ip: IpAddr) -> Option<ConnectionGuard> {
        let max = self.max_connections.read().map(|g| *g).unwrap_or(1);
        self.last_seen.insert(ip, Instant::now());

        let mut entry = self.connections.entry(ip).or_insert(0);
        if *entry >= max {
            return None;
        }
        *entry += 1;
        drop(entry);
        Some(ConnectionGuard {
            connections: Arc::clone(&self.connections),
            ip,
        })
    }

    /// Current in-flight connections for an IP (tests, stats).
    #[must_use]
    pub fn connections_for(&self, ip: IpAddr) -> u32 {
        self.connections.get(&ip).map_or(0, |e| *e)
    }

    /// Sweep entries idle past the TTL.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let mut stale = Vec::new();
        for entry in &self.last_seen {
            if now.duration_since(*entry.value()) > IDLE_TTL {
                stale.push(*entry.key());
            }
        }
        for ip in stale {
            self.last_seen.remove(&ip);
            self.connections.remove_if(&ip, |_, count| *count == 0);
        }
        if let Ok(limiter) = self.limiter.read() {
            limiter.retain_recent();
        }
        debug!(tracked = self.last_seen.len(), "limiter tables swept");
    }
}

fn build_limiter(rate_per_second: u32, burst: u32) -> KeyedLimiter {
    let rate = NonZeroU32::new(rate_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN);
    RateLimiter::keyed(Quota::per_second(rate).allow_burst(burst))
}

/// RAII connection slot: released on drop.
pub struct ConnectionGuard {
    connections: Arc<DashMap<IpAddr, u32>>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
        }
    }
}

impl std::fmt::Debug for Limits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limits").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn burst_allows_then_rejects() {
        let limits = Limits::new(1, 5, 100);
        for _ in 0..5 {
            assert!(limits.check_rate(ip(1)));
        }
        assert!(!limits.check_rate(ip(1)));
    }

    #[test]
    fn buckets_are_per_ip() {
        let limits = Limits::new(1, 2, 100);
        assert!(limits.check_rate(ip(1)));
        assert!(limits.check_rate(ip(1)));
        assert!(!limits.check_rate(ip(1)));
        // A different client still has its burst.
        assert!(limits.check_rate(ip(2)));
    }

    #[test]
    fn connection_cap_and_release() {
        let limits = Limits::new(100, 100, 2);
        let a = limits.acquire_connection(ip(1));
        let b = limits.acquire_connection(ip(1));
        assert!(a.is_some() && b.is_some());
        assert!(limits.acquire_connection(ip(1)).is_none());
        assert_eq!(limits.connections_for(ip(1)), 2);

        drop(a);
        assert_eq!(limits.connections_for(ip(1)), 1);
        assert!(limits.acquire_connection(ip(1)).is_some());
    }

    #[test]
    fn connection_cap_is_per_ip() {
        let limits = Limits::new(100, 100, 1);
        let _a = limits.acquire_connection(ip(1));
        assert!(limits.acquire_connection(ip(1)).is_none());
        assert!(limits.acquire_connection(ip(2)).is_some());
    }

    #[test]
    fn reconfigure_applies_new_burst() {
        let limits = Limits::new(1, 1, 1);
        assert!(limits.check_rate(ip(1)));
        assert!(!limits.check_rate(ip(1)));

        limits.reconfigure(1, 10, 1);
        for _ in 0..10 {
            assert!(limits.check_rate(ip(1)));
        }
        assert_eq!(limits.burst(), 10);
    }

    #[test]
    fn sweep_keeps_active_connections() {
        let limits = Limits::new(100, 100, 5);
        let _guard = limits.acquire_connection(ip(1));
        limits.sweep_idle();
        // Just exercised; nothing idle yet.
        assert_eq!(limits.connections_for(ip(1)), 1);
    }
}
