//! Reverse peer-address lookup cache.
//!
//! Inbound protocol events carry a remote peer address, not a session id.
//! Resolving one to the other would otherwise scan every live connection,
//! so resolutions are cached here with a short TTL and a hard capacity
//! bound. The cache is populated lazily by the lookup path and invalidated
//! whenever a session disconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use roost_core::SessionId;

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            capacity: 200,
        }
    }
}

/// Canonical form of a peer address: trimmed, lowercased, device suffix
/// (everything from `/`) stripped.
pub(crate) fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let base = trimmed.split('/').next().unwrap_or(trimmed);
    base.to_ascii_lowercase()
}

struct CacheSlot {
    session_id: SessionId,
    stored_at: Instant,
}

/// Peer address to session id cache with TTL expiry and
/// oldest-timestamp eviction at capacity.
pub struct ReverseLookupCache {
    config: LookupConfig,
    slots: Mutex<HashMap<String, CacheSlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ReverseLookupCache {
    pub fn new(config: LookupConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolves a peer address, expiring the entry if its TTL has lapsed.
    pub fn get(&self, address: &str) -> Option<SessionId> {
        let key = normalize_address(address);
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&key) {
            if slot.stored_at.elapsed() <= self.config.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(slot.session_id.clone());
            }
            slots.remove(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Caches a resolution. At capacity the entry with the oldest timestamp
    /// is evicted; re-inserting an existing address refreshes its timestamp.
    pub fn insert(&self, address: &str, session_id: SessionId) {
        let key = normalize_address(address);
        let mut slots = self.slots.lock();
        if !slots.contains_key(&key) && slots.len() >= self.config.capacity {
            if let Some(oldest) = slots
                .iter()
                .min_by_key(|(_, slot)| slot.stored_at)
                .map(|(k, _)| k.clone())
            {
                slots.remove(&oldest);
            }
        }
        slots.insert(
            key,
            CacheSlot {
                session_id,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drops every entry pointing at `session_id`. Called on disconnect so
    /// inbound events cannot route to a dead session.
    pub fn invalidate_session(&self, session_id: &SessionId) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.session_id != *session_id);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for ReverseLookupCache {
    fn default() -> Self {
        Self::new(LookupConfig::default())
    }
}
