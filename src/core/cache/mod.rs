//! Voice embedding and synthesis result caches
//!
//! Both caches are explicitly constructed and owned by the engine. Each has
//! its own byte budget, its own lock, and coalesces concurrent misses for the
//! same key into one load or computation.

pub mod lru;
pub mod manifest;
pub mod result;
pub mod single_flight;
pub mod voice;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use lru::ByteLru;
pub use manifest::{ManifestEntry, ManifestSource, VoiceManifest, sha256_hex};
pub use result::{DEFAULT_RESULT_CACHE_BYTES, Fingerprint, ResultCache, ResultSource};
pub use single_flight::{FlightRole, SingleFlight};
pub use voice::{
    DEFAULT_EMBEDDING_DIM, DEFAULT_VOICE_CACHE_BYTES, PreloadReport, VoiceCacheConfig,
    VoiceEmbedding, VoiceEmbeddingCache,
};

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that started a load or computation
    pub misses: u64,
    /// Lookups that joined an in-flight load or computation
    pub coalesced: u64,
    pub evictions: u64,
    pub entries: usize,
    pub pinned: usize,
    pub bytes: u64,
    pub capacity_bytes: u64,
}

impl CacheStats {
    /// Fraction of lookups that did not start new work
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.coalesced) as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: usize) {
        if count > 0 {
            self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(
        &self,
        entries: usize,
        pinned: usize,
        bytes: u64,
        capacity_bytes: u64,
    ) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries,
            pinned,
            bytes,
            capacity_bytes,
        }
    }
}
