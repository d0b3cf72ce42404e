//! Response cache
//!
//! Successful results keyed by request fingerprint. Entries expire after the
//! TTL; when full, the least recently used entry is evicted. Results are
//! shared as `Arc`s so a hit hands back the very object the run produced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::config::CacheSettings;
use crate::types::{Fingerprint, InferenceResult};

struct Entry {
    result: Arc<InferenceResult>,
    inserted_at: Instant,
    /// Access tick, for LRU eviction
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Fingerprint, Entry>,
    tick: u64,
}

/// Counters reported in service status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// TTL + LRU cache of completed results
pub struct ResponseCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.ttl(), settings.max_entries)
    }

    /// Look up a live entry
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<InferenceResult>> {
        self.get_at(fingerprint, Instant::now())
    }

    pub fn get_at(&self, fingerprint: &Fingerprint, now: Instant) -> Option<Arc<InferenceResult>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.tick += 1;

        let expired = match state.entries.get_mut(fingerprint) {
            Some(entry) if now.saturating_duration_since(entry.inserted_at) < self.ttl => {
                entry.last_used = state.tick;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.result));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.remove(fingerprint);
            trace!(fingerprint = %fingerprint.short(), "Cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a result, evicting the least recently used entry when full
    pub fn insert(&self, fingerprint: Fingerprint, result: Arc<InferenceResult>) {
        self.insert_at(fingerprint, result, Instant::now());
    }

    pub fn insert_at(&self, fingerprint: Fingerprint, result: Arc<InferenceResult>, now: Instant) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.tick += 1;

        if !state.entries.contains_key(&fingerprint) && state.entries.len() >= self.max_entries {
            let removed = Self::evict_expired(state, self.ttl, now);
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);

            if state.entries.len() >= self.max_entries {
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(fp, _)| fp.clone());
                if let Some(oldest) = oldest {
                    state.entries.remove(&oldest);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    trace!(fingerprint = %oldest.short(), "Evicted least recently used entry");
                }
            }
        }

        let tick = state.tick;
        state.entries.insert(
            fingerprint,
            Entry {
                result,
                inserted_at: now,
                last_used: tick,
            },
        );
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        let removed = Self::evict_expired(&mut state, self.ttl, Instant::now());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn evict_expired(state: &mut CacheState, ttl: Duration, now: Instant) -> usize {
        let before = state.entries.len();
        state
            .entries
            .retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);
        before - state.entries.len()
    }

    /// Entries currently held (expired ones count until touched or purged)
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
