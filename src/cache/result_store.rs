//! Reads and writes result envelopes, absorbing every store failure.
//!
//! Caching is an optimization. A store that is down, slow, or holding an
//! unreadable envelope turns into a miss on read and a logged no-op on write;
//! none of it reaches the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::envelope::{CachedEnvelope, EnvelopeSummary};
use super::key::CacheKey;
use super::store::KeyValueStore;
use crate::errors::StoreError;

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Store or decode failures that were turned into misses
    pub read_errors: u64,
    pub writes: u64,
    pub write_errors: u64,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    read_errors: AtomicU64,
    writes: AtomicU64,
    write_errors: AtomicU64,
}

/// Envelope persistence on top of a [`KeyValueStore`].
#[derive(Clone)]
pub struct ResultStore {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
    counters: Arc<Counters>,
}

impl ResultStore {
    pub fn new(store: Arc<dyn KeyValueStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Key under which the envelope for `key` is stored.
    pub fn storage_key(&self, key: &CacheKey) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.key_prefix)
        }
    }

    /// Looks up an envelope. Any failure is logged and reported as a miss.
    ///
    /// Unreadable envelopes are left in place; the next successful write for
    /// the same key replaces them.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<CachedEnvelope<T>> {
        let storage_key = self.storage_key(key);
        let bytes = match self.store.get(&storage_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(key = %storage_key, "Cache miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Cache lookup failed, treating as miss");
                self.record_read_error();
                return None;
            }
        };

        match CachedEnvelope::decode(&bytes) {
            Ok(envelope) => {
                debug!(key = %storage_key, "Cache hit");
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(envelope)
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Cached envelope unreadable, treating as miss");
                self.record_read_error();
                None
            }
        }
    }

    /// Persists an envelope. Returns whether it was written; failures are
    /// logged and otherwise ignored.
    pub async fn set<T: Serialize>(
        &self,
        key: &CacheKey,
        envelope: &CachedEnvelope<T>,
        ttl: Duration,
    ) -> bool {
        let storage_key = self.storage_key(key);
        let result = match envelope.encode() {
            Ok(bytes) => self.store.set(&storage_key, bytes, ttl).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(key = %storage_key, ttl_secs = ttl.as_secs(), "Cached result");
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Failed to persist result");
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Envelope metadata and remaining TTL, with store errors surfaced.
    pub async fn inspect(
        &self,
        key: &CacheKey,
    ) -> Result<Option<(EnvelopeSummary, Option<Duration>)>, StoreError> {
        let storage_key = self.storage_key(key);
        let Some(bytes) = self.store.get(&storage_key).await? else {
            return Ok(None);
        };
        let summary = EnvelopeSummary::decode(&bytes)?;
        let ttl = self.store.ttl(&storage_key).await?;
        Ok(Some((summary, ttl)))
    }

    /// Resets the expiry of a stored envelope.
    pub async fn extend(&self, key: &CacheKey, ttl: Duration) -> Result<bool, StoreError> {
        self.store.expire(&self.storage_key(key), ttl).await
    }

    pub async fn evict(&self, key: &CacheKey) -> Result<bool, StoreError> {
        self.store.delete(&self.storage_key(key)).await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
        }
    }

    fn record_read_error(&self) {
        self.counters.read_errors.fetch_add(1, Ordering::Relaxed);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }
}
