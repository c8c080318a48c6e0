//! Time-bounded destination-IP to domain-name cache.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MIN_TTL_SECONDS: u64 = 30;
pub const MAX_TTL_SECONDS: u64 = 3600;

#[derive(Debug, Clone)]
struct CacheEntry {
    domain: String,
    expires_at: Instant,
}

/// Concurrent map from destination IP to the most-recently-seen domain.
/// Written by the DNS inspector, read by both forwarders at flow creation.
/// Expired entries miss and are removed opportunistically at lookup time.
pub struct DomainCache {
    entries: RwLock<FxHashMap<IpAddr, CacheEntry>>,
}

impl DomainCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(FxHashMap::default()),
        })
    }

    /// Insert or refresh a mapping. The TTL from the DNS answer is clamped
    /// to [MIN_TTL_SECONDS, MAX_TTL_SECONDS].
    pub fn insert(&self, addr: IpAddr, domain: &str, ttl_seconds: u32) {
        let clamped = u64::from(ttl_seconds).clamp(MIN_TTL_SECONDS, MAX_TTL_SECONDS);
        let entry = CacheEntry {
            domain: domain.to_string(),
            expires_at: Instant::now() + Duration::from_secs(clamped),
        };
        self.entries.write().insert(addr, entry);
    }

    /// Most-recently-seen domain for `addr`, or `None` on miss/expiry.
    pub fn lookup(&self, addr: &IpAddr) -> Option<String> {
        {
            let guard = self.entries.read();
            match guard.get(addr) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.domain.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Entry present but expired: evict it now.
        let mut guard = self.entries.write();
        if let Some(entry) = guard.get(addr) {
            if entry.expires_at <= Instant::now() {
                guard.remove(addr);
            } else {
                return Some(entry.domain.clone());
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn force_expire(&self, addr: &IpAddr) {
        let mut guard = self.entries.write();
        if let Some(entry) = guard.get_mut(addr) {
            entry.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }

    #[cfg(test)]
    pub(crate) fn remaining_ttl(&self, addr: &IpAddr) -> Option<Duration> {
        let guard = self.entries.read();
        guard
            .get(addr)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
    }
}
