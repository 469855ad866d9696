//! Voice embedding cache
//!
//! Voice files are raw little-endian `f32` matrices of shape
//! `[rows, embedding_dim]`; row `n` is the style vector for an utterance of
//! `n + 1` phonemes. A file is decoded only after its SHA-256 matches the
//! manifest, so a truncated or modified file never yields a partial
//! embedding.
//!
//! Loads are single-flight per voice id and run on the blocking pool; the
//! cache lock is only taken to look up or publish an entry.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use arc_swap::ArcSwap;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::lru::ByteLru;
use super::manifest::{ManifestEntry, ManifestSource, VoiceManifest, sha256_hex};
use super::single_flight::{FlightRole, SingleFlight};
use super::{CacheCounters, CacheStats};
use crate::errors::{EngineError, EngineResult};

/// Style vector width of the reference acoustic models
pub const DEFAULT_EMBEDDING_DIM: usize = 256;
/// Default voice cache budget (64 MB)
pub const DEFAULT_VOICE_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// Decoded voice embedding. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceEmbedding {
    voice_id: String,
    values: Vec<f32>,
    dim: usize,
    checksum: String,
}

impl VoiceEmbedding {
    /// Decode a raw voice file whose checksum has already been verified
    pub fn decode(voice_id: &str, bytes: &[u8], dim: usize, checksum: String) -> EngineResult<Self> {
        let row_bytes = dim * std::mem::size_of::<f32>();
        if dim == 0 || bytes.is_empty() || bytes.len() % row_bytes != 0 {
            return Err(EngineError::Integrity {
                voice_id: voice_id.to_string(),
                expected: format!("a whole number of {dim}-wide f32 rows"),
                actual: format!("{} bytes", bytes.len()),
            });
        }

        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Self {
            voice_id: voice_id.to_string(),
            values,
            dim,
            checksum,
        })
    }

    /// Build an embedding from in-memory values
    pub fn from_values(
        voice_id: impl Into<String>,
        values: Vec<f32>,
        dim: usize,
        checksum: String,
    ) -> EngineResult<Self> {
        if dim == 0 || values.is_empty() || values.len() % dim != 0 {
            return Err(EngineError::InvalidRequest(format!(
                "embedding of {} values is not a whole number of {dim}-wide rows",
                values.len()
            )));
        }
        Ok(Self {
            voice_id: voice_id.into(),
            values,
            dim,
            checksum,
        })
    }

    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn rows(&self) -> usize {
        self.values.len() / self.dim
    }

    /// SHA-256 of the source file
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Style row for an utterance of `phoneme_count` phonemes
    pub fn style_for(&self, phoneme_count: usize) -> &[f32] {
        let row = phoneme_count.saturating_sub(1).min(self.rows() - 1);
        &self.values[row * self.dim..(row + 1) * self.dim]
    }

    /// The embedding in its on-disk encoding
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn byte_size(&self) -> u64 {
        (self.values.len() * std::mem::size_of::<f32>()
            + self.voice_id.len()
            + self.checksum.len()
            + std::mem::size_of::<Self>()) as u64
    }
}

/// Voice cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceCacheConfig {
    pub capacity_bytes: u64,
    pub embedding_dim: usize,
}

impl Default for VoiceCacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_VOICE_CACHE_BYTES,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
        }
    }
}

/// Outcome of a batch preload
#[derive(Debug, Default)]
pub struct PreloadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, EngineError)>,
}

struct VoiceCacheShared {
    lru: Mutex<ByteLru<String, Arc<VoiceEmbedding>>>,
    pinned: Mutex<HashSet<String>>,
    manifest: ArcSwap<VoiceManifest>,
    counters: CacheCounters,
    config: VoiceCacheConfig,
}

impl VoiceCacheShared {
    fn lookup(&self, voice_id: &String) -> Option<Arc<VoiceEmbedding>> {
        self.lru.lock().get(voice_id)
    }

    /// Insert a freshly loaded embedding. Returns false, leaving the cache
    /// untouched, when the manifest no longer lists the checksum it was
    /// verified against.
    fn publish(&self, embedding: Arc<VoiceEmbedding>) -> bool {
        let voice_id = embedding.voice_id().to_string();
        let pinned = self.pinned.lock().contains(&voice_id);
        let size = embedding.byte_size();

        // Manifest swaps happen under the LRU lock, so this check and the
        // insert see the same manifest
        let mut lru = self.lru.lock();
        let current = self
            .manifest
            .load()
            .get(&voice_id)
            .is_some_and(|entry| entry.sha256.eq_ignore_ascii_case(embedding.checksum()));
        if !current {
            drop(lru);
            debug!(voice_id = %voice_id, "Discarded voice loaded under a replaced manifest");
            return false;
        }
        let evicted = lru.insert(voice_id, embedding, size, pinned);
        drop(lru);

        for id in &evicted {
            debug!(voice_id = %id, "Evicted voice embedding");
        }
        self.counters.record_evictions(evicted.len());
        true
    }
}

/// Bounded, checksum-verified cache of decoded voice embeddings
pub struct VoiceEmbeddingCache {
    shared: Arc<VoiceCacheShared>,
    flights: SingleFlight<String, Arc<VoiceEmbedding>>,
    source: Option<ManifestSource>,
    source_modified: Mutex<Option<SystemTime>>,
}

impl VoiceEmbeddingCache {
    /// Cache over a fixed manifest
    pub fn new(manifest: VoiceManifest, config: VoiceCacheConfig) -> Self {
        Self {
            shared: Arc::new(VoiceCacheShared {
                lru: Mutex::new(ByteLru::new(config.capacity_bytes)),
                pinned: Mutex::new(HashSet::new()),
                manifest: ArcSwap::from_pointee(manifest),
                counters: CacheCounters::default(),
                config,
            }),
            flights: SingleFlight::new(),
            source: None,
            source_modified: Mutex::new(None),
        }
    }

    /// Cache over a manifest that is reloaded when its source changes
    pub fn from_source(source: ManifestSource, config: VoiceCacheConfig) -> EngineResult<Self> {
        let modified = source.modified();
        let manifest = source.load()?;
        info!(
            "Voice cache initialized with {} voice(s), budget {} bytes",
            manifest.len(),
            config.capacity_bytes
        );

        let mut cache = Self::new(manifest, config);
        cache.source = Some(source);
        *cache.source_modified.get_mut() = modified;
        Ok(cache)
    }

    pub fn manifest(&self) -> Arc<VoiceManifest> {
        self.shared.manifest.load_full()
    }

    pub fn config(&self) -> &VoiceCacheConfig {
        &self.shared.config
    }

    /// Return the embedding for `voice_id`, loading and verifying it on a miss
    pub async fn get(&self, voice_id: &str) -> EngineResult<Arc<VoiceEmbedding>> {
        let key = voice_id.to_string();
        if let Some(embedding) = self.shared.lookup(&key) {
            self.shared.counters.record_hit();
            debug!(voice_id, "Voice cache hit");
            return Ok(embedding);
        }

        let shared = self.shared.clone();
        let voice_id = key.clone();
        let (result, role) = self
            .flights
            .run(
                &key,
                || self.shared.lookup(&key),
                move || {
                    async move {
                        let embedding = Arc::new(load_voice(&shared, &voice_id).await?);
                        shared.publish(embedding.clone());
                        Ok(embedding)
                    }
                    .boxed()
                },
            )
            .await;

        match role {
            FlightRole::Cached => self.shared.counters.record_hit(),
            FlightRole::Leader => self.shared.counters.record_miss(),
            FlightRole::Follower => self.shared.counters.record_coalesced(),
        }
        result
    }

    /// Load a batch of voices concurrently and pin them against eviction
    pub async fn preload<I, S>(&self, voice_ids: I) -> PreloadReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = voice_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();

        {
            let mut pinned = self.shared.pinned.lock();
            pinned.extend(ids.iter().cloned());
        }
        {
            let mut lru = self.shared.lru.lock();
            for id in &ids {
                lru.set_pinned(id, true);
            }
        }

        let results = join_all(ids.iter().map(|id| self.get(id))).await;

        let mut report = PreloadReport::default();
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(_) => report.loaded.push(id),
                Err(e) => {
                    warn!(voice_id = %id, error = %e, "Voice preload failed");
                    self.shared.pinned.lock().remove(&id);
                    report.failed.push((id, e));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Voice preload complete"
        );
        report
    }

    /// Clear the pin on `voice_id`. Returns whether it was pinned.
    pub fn unpin(&self, voice_id: &str) -> bool {
        let was_pinned = self.shared.pinned.lock().remove(voice_id);
        let (_, evicted) = self.shared.lru.lock().set_pinned(&voice_id.to_string(), false);
        self.shared.counters.record_evictions(evicted.len());
        was_pinned
    }

    pub fn is_pinned(&self, voice_id: &str) -> bool {
        self.shared.pinned.lock().contains(voice_id)
    }

    /// Drop the cached embedding; the next `get` reloads and re-verifies it.
    /// Pins survive invalidation.
    pub fn invalidate(&self, voice_id: &str) -> bool {
        self.shared.lru.lock().remove(&voice_id.to_string()).is_some()
    }

    /// Reload the manifest if its source changed since the last check.
    ///
    /// Cached embeddings whose manifest entry changed or disappeared are
    /// invalidated. Returns whether a new manifest was installed.
    pub fn refresh_if_changed(&self) -> EngineResult<bool> {
        let Some(source) = &self.source else {
            return Ok(false);
        };

        let modified = source.modified();
        {
            let last = self.source_modified.lock();
            if modified.is_some() && *last == modified {
                return Ok(false);
            }
        }

        let next = source.load()?;
        self.install_manifest(next);
        *self.source_modified.lock() = modified;
        Ok(true)
    }

    /// Replace the manifest, invalidating embeddings whose entry changed
    pub fn install_manifest(&self, next: VoiceManifest) -> Vec<String> {
        let mut invalidated = Vec::new();
        {
            let mut lru = self.shared.lru.lock();
            let previous = self.shared.manifest.load_full();
            let changed = previous.changed_voices(&next);
            self.shared.manifest.store(Arc::new(next));

            for id in changed {
                if lru.remove(&id).is_some() {
                    invalidated.push(id);
                }
            }
        }

        if !invalidated.is_empty() {
            info!(
                voices = ?invalidated,
                "Invalidated cached voices after manifest change"
            );
        }
        invalidated
    }

    pub fn stats(&self) -> CacheStats {
        let lru = self.shared.lru.lock();
        self.shared
            .counters
            .snapshot(lru.len(), lru.pinned_len(), lru.bytes(), lru.capacity())
    }

    /// Voice ids currently resident, least recently used first
    pub fn resident(&self) -> Vec<String> {
        self.shared.lru.lock().keys_by_recency()
    }

    pub fn clear(&self) {
        self.shared.lru.lock().clear();
    }
}

async fn load_voice(shared: &VoiceCacheShared, voice_id: &str) -> EngineResult<VoiceEmbedding> {
    let manifest = shared.manifest.load_full();
    let entry: ManifestEntry = manifest
        .get(voice_id)
        .cloned()
        .ok_or_else(|| EngineError::VoiceNotFound {
            voice_id: voice_id.to_string(),
            reason: "not present in the voice manifest".to_string(),
        })?;

    let dim = shared.config.embedding_dim;
    let id = voice_id.to_string();
    let started = Instant::now();

    let embedding = tokio::task::spawn_blocking(move || {
        let bytes = std::fs::read(&entry.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::VoiceNotFound {
                    voice_id: id.clone(),
                    reason: format!("voice file {} is missing", entry.path.display()),
                }
            } else {
                EngineError::io(&format!("reading voice file {}", entry.path.display()), e)
            }
        })?;

        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(&entry.sha256) {
            return Err(EngineError::Integrity {
                voice_id: id,
                expected: entry.sha256.clone(),
                actual,
            });
        }

        VoiceEmbedding::decode(&id, &bytes, dim, actual)
    })
    .await
    .map_err(|e| EngineError::Io(format!("voice load task failed: {e}")))?;

    match &embedding {
        Ok(embedding) => debug!(
            voice_id,
            rows = embedding.rows(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded voice embedding"
        ),
        Err(e @ EngineError::Integrity { .. }) => {
            warn!(voice_id, error = %e, "Voice file failed integrity check")
        }
        Err(_) => {}
    }
    embedding
}
