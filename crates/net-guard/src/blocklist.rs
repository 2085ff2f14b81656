use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, info};

/// Why and until when an address is refused.
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub reason: String,
    /// `None` means permanent (configured statically).
    pub expires_at: Option<Instant>,
}

impl BlockEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Concurrent set of blocked client addresses.
///
/// Expired entries are removed lazily on lookup and by [`Blocklist::purge_expired`].
#[derive(Debug, Default)]
pub struct Blocklist {
    entries: DashMap<IpAddr, BlockEntry>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a blocklist with permanent entries for each address.
    pub fn with_permanent(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let list = Self::new();
        for ip in addrs {
            list.entries.insert(
                ip,
                BlockEntry {
                    reason: "static".to_string(),
                    expires_at: None,
                },
            );
        }
        list
    }

    /// Block `ip` for `duration`. An existing permanent entry is kept; an
    /// existing timed entry is extended if the new expiry is later.
    pub fn block_for(&self, ip: IpAddr, duration: Duration, reason: impl Into<String>) {
        let expires_at = Instant::now() + duration;
        let reason = reason.into();

        self.entries
            .entry(ip)
            .and_modify(|entry| {
                if let Some(current) = entry.expires_at {
                    if current < expires_at {
                        entry.expires_at = Some(expires_at);
                        entry.reason = reason.clone();
                    }
                }
            })
            .or_insert_with(|| BlockEntry {
                reason: reason.clone(),
                expires_at: Some(expires_at),
            });

        info!(
            client_addr = %ip,
            block_secs = duration.as_secs(),
            reason = %reason,
            "client address blocked"
        );
    }

    /// Current block reason for `ip`, if any.
    pub fn lookup(&self, ip: IpAddr) -> Option<BlockEntry> {
        let now = Instant::now();
        let entry = self.entries.get(&ip)?.clone();
        if entry.is_expired(now) {
            // Re-check under the shard lock so a concurrent extension survives.
            self.entries.remove_if(&ip, |_, e| e.is_expired(now));
            debug!(client_addr = %ip, "block expired");
            return None;
        }
        Some(entry)
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.lookup(ip).is_some()
    }

    pub fn unblock(&self, ip: IpAddr) -> bool {
        self.entries.remove(&ip).is_some()
    }

    /// Drop all expired entries and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn timed_block_is_active_until_expiry() {
        let list = Blocklist::new();
        list.block_for(ip("8.8.8.8"), Duration::from_secs(60), "auth_violation");

        let entry = list.lookup(ip("8.8.8.8")).unwrap();
        assert_eq!(entry.reason, "auth_violation");
        assert!(!list.is_blocked(ip("8.8.4.4")));
    }

    #[test]
    fn expired_entries_are_dropped_on_lookup() {
        let list = Blocklist::new();
        list.block_for(ip("1.2.3.4"), Duration::ZERO, "test");
        assert!(!list.is_blocked(ip("1.2.3.4")));
        assert!(list.is_empty());
    }

    #[test]
    fn permanent_entries_survive_timed_blocks_and_purges() {
        let list = Blocklist::with_permanent([ip("10.9.9.9")]);
        list.block_for(ip("10.9.9.9"), Duration::ZERO, "later");
        list.block_for(ip("5.5.5.5"), Duration::ZERO, "gone");

        assert_eq!(list.purge_expired(), 1);
        let entry = list.lookup(ip("10.9.9.9")).unwrap();
        assert!(entry.expires_at.is_none());
        assert_eq!(entry.reason, "static");
    }

    #[test]
    fn unblock_removes_entry() {
        let list = Blocklist::new();
        list.block_for(ip("9.9.9.9"), Duration::from_secs(60), "x");
        assert!(list.unblock(ip("9.9.9.9")));
        assert!(!list.is_blocked(ip("9.9.9.9")));
    }
}
