//! Synthesis result cache
//!
//! Maps a request [`Fingerprint`] to the encoded audio produced for it.
//! Concurrent requests for the same fingerprint share one computation and
//! receive the same `Arc<AudioBuffer>`, or the same error. Failed
//! computations leave no entry.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_128;

use super::lru::ByteLru;
use super::single_flight::{FlightRole, SingleFlight};
use super::{CacheCounters, CacheStats};
use crate::core::audio::AudioBuffer;
use crate::core::types::{PhonemeSequence, SynthesisParams};
use crate::errors::EngineError;

/// Default result cache budget (256 MB)
pub const DEFAULT_RESULT_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Key capturing every audio-affecting input of a request
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Hash a canonical encoding of the request.
    ///
    /// `voice_checksum` is the SHA-256 of the voice file the request will be
    /// rendered with, so replacing a voice file changes every fingerprint
    /// that uses it. Parameters are normalized first, so requests that differ
    /// only below the quantization step share a fingerprint. Variable-length
    /// fields are length-prefixed, so no two distinct requests share an
    /// encoding.
    pub fn compute(
        phonemes: &PhonemeSequence,
        voice_id: &str,
        voice_checksum: &str,
        params: &SynthesisParams,
    ) -> Self {
        let params = params.normalized();
        let tokens = phonemes
            .tokens()
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let canonical = format!(
            "v2|voice={}:{}|sha256={}:{}|speed={:.3}|rate={}|format={}|phonemes={}:{}|tokens={}:{}",
            voice_id.len(),
            voice_id,
            voice_checksum.len(),
            voice_checksum.to_ascii_lowercase(),
            params.speed,
            params.sample_rate,
            params.format,
            phonemes.phonemes().len(),
            phonemes.phonemes(),
            phonemes.tokens().len(),
            tokens,
        );
        Self(xxh3_128(canonical.as_bytes()))
    }

    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({:032x})", self.0)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// Served from the cache
    Hit,
    /// This caller ran the computation
    Computed,
    /// This caller waited on another caller's computation
    Coalesced,
}

struct ResultCacheShared {
    lru: Mutex<ByteLru<Fingerprint, Arc<AudioBuffer>>>,
    counters: CacheCounters,
}

/// Bounded fingerprint → audio cache with single-flight computation.
///
/// `E` is the error a failed computation hands to every waiter.
pub struct ResultCache<E = EngineError> {
    shared: Arc<ResultCacheShared>,
    flights: SingleFlight<Fingerprint, Arc<AudioBuffer>, E>,
}

impl<E> ResultCache<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            shared: Arc::new(ResultCacheShared {
                lru: Mutex::new(ByteLru::new(capacity_bytes)),
                counters: CacheCounters::default(),
            }),
            flights: SingleFlight::new(),
        }
    }

    /// Cached audio for `fingerprint`, computing it at most once concurrently
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        compute: F,
    ) -> Result<Arc<AudioBuffer>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<AudioBuffer>, E>> + Send + 'static,
    {
        self.lookup_or_compute(fingerprint, compute)
            .await
            .map(|(audio, _)| audio)
    }

    /// Like [`get_or_compute`](Self::get_or_compute), also reporting where the
    /// result came from
    pub async fn lookup_or_compute<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        compute: F,
    ) -> Result<(Arc<AudioBuffer>, ResultSource), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<AudioBuffer>, E>> + Send + 'static,
    {
        if let Some(audio) = self.get(&fingerprint) {
            return Ok((audio, ResultSource::Hit));
        }

        let shared = self.shared.clone();
        let (result, role) = self
            .flights
            .run(
                &fingerprint,
                || self.shared.lru.lock().get(&fingerprint),
                move || {
                    let computation = compute();
                    async move {
                        let audio = computation.await?;
                        let size = audio.byte_size();
                        let evicted = shared.lru.lock().insert(fingerprint, audio.clone(), size, false);
                        shared.counters.record_evictions(evicted.len());
                        Ok(audio)
                    }
                    .boxed()
                },
            )
            .await;

        let source = match role {
            FlightRole::Cached => {
                self.shared.counters.record_hit();
                ResultSource::Hit
            }
            FlightRole::Leader => {
                self.shared.counters.record_miss();
                ResultSource::Computed
            }
            FlightRole::Follower => {
                self.shared.counters.record_coalesced();
                ResultSource::Coalesced
            }
        };
        debug!(fingerprint = %fingerprint, source = ?source, ok = result.is_ok(), "Result cache lookup");
        result.map(|audio| (audio, source))
    }

    /// Cached audio for `fingerprint`, without computing
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<AudioBuffer>> {
        let audio = self.shared.lru.lock().get(fingerprint);
        if audio.is_some() {
            self.shared.counters.record_hit();
        }
        audio
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.shared.lru.lock().contains(fingerprint)
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.shared.lru.lock().remove(fingerprint).is_some()
    }

    pub fn clear(&self) {
        self.shared.lru.lock().clear();
    }

    /// Number of fingerprints with a computation in progress
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    pub fn stats(&self) -> CacheStats {
        let lru = self.shared.lru.lock();
        self.shared
            .counters
            .snapshot(lru.len(), lru.pinned_len(), lru.bytes(), lru.capacity())
    }
}
