//! Synthesis orchestrator
//!
//! The engine is the composition root of the core. It owns the fallback
//! manager and both caches and is the only entry point for callers:
//!
//! ```text
//! synthesize ─▶ result cache ──miss──▶ voice cache ─▶ fallback manager ─▶ backend
//!                  ▲                                                        │
//!                  └──────────── encode ◀──────────── raw samples ◀─────────┘
//! ```
//!
//! The computation for a fingerprint is one future shared by every
//! concurrent caller of that fingerprint. It holds its own references to the
//! engine internals so it never borrows from a single request, and it is
//! dropped once the last of those callers goes away. A failed computation
//! resolves to one [`SynthesisFailure`], so every caller sees the same
//! attempted backend.
//!
//! Fingerprints include the checksum the voice manifest holds for the
//! requested voice. Replacing a voice file therefore routes requests to new
//! cache entries instead of audio rendered with the old embedding.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::audio::AudioBuffer;
use super::backend::native::SessionLoader;
use super::backend::{BackendFactory, BackendOptions, InferenceBackend};
use super::cache::{
    CacheStats, DEFAULT_RESULT_CACHE_BYTES, Fingerprint, ManifestSource, PreloadReport,
    ResultCache, ResultSource, VoiceCacheConfig, VoiceEmbeddingCache, VoiceManifest,
};
use super::fallback::{BackendCandidate, BackendStatus, FallbackManager, FallbackPolicy};
use super::model::{classify, discover_models};
use super::types::{InferenceParams, PhonemeSequence, SynthesisParams};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult, SynthesisFailure};

/// Default interval between voice manifest modification checks
pub const DEFAULT_MANIFEST_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Audio returned to the caller
#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub audio: Arc<AudioBuffer>,
    /// True when no new inference ran for this request
    pub cached: bool,
    pub source: ResultSource,
    pub fingerprint: Fingerprint,
}

/// Cache occupancy and counters for both caches
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EngineCacheStats {
    pub voices: CacheStats,
    pub results: CacheStats,
}

/// Engine snapshot for operators
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub active_backend: Option<String>,
    pub backends: Vec<BackendStatus>,
    pub caches: EngineCacheStats,
    pub in_flight: usize,
    pub voices_in_manifest: usize,
}

struct EngineInner {
    manager: FallbackManager,
    voices: VoiceEmbeddingCache,
    results: ResultCache<SynthesisFailure>,
    manifest_check_interval: Duration,
    last_manifest_check: Mutex<Option<Instant>>,
}

/// Entry point for synthesis requests
#[derive(Clone)]
pub struct SynthesisEngine {
    inner: Arc<EngineInner>,
}

impl SynthesisEngine {
    pub fn builder() -> SynthesisEngineBuilder {
        SynthesisEngineBuilder::default()
    }

    /// Build an engine from configuration.
    ///
    /// Models are classified up front: configured backends in declaration
    /// order, then any models discovered in `model_dir`.
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidConfiguration(e.to_string()))?;

        let classifier = config.classifier_config();
        let mut candidates = Vec::new();
        for backend in &config.backends {
            let descriptor = classify(&backend.model, &classifier)?;
            let mut candidate = BackendCandidate::new(backend.name.clone(), descriptor)
                .with_preference(backend.preference.unwrap_or(config.backend_preference));
            candidate.priority = backend.priority;
            candidates.push(candidate);
        }
        if let Some(dir) = &config.model_dir {
            for descriptor in discover_models(dir, &classifier)? {
                let name = descriptor.file_name();
                if candidates.iter().any(|c: &BackendCandidate| c.name == name) {
                    continue;
                }
                candidates.push(
                    BackendCandidate::new(name, descriptor)
                        .with_preference(config.backend_preference),
                );
            }
        }

        Self::builder()
            .candidates(candidates)
            .policy(config.fallback_policy())
            .backend_options(config.backend_options())
            .voice_source(config.manifest_source()?, config.voice_cache_config())
            .result_cache_bytes(config.result_cache_bytes)
            .manifest_check_interval(config.manifest_check_interval)
            .build()
    }

    /// Synthesize audio for a phoneme sequence in the given voice.
    ///
    /// Identical concurrent requests share one inference and receive the
    /// same buffer. A transient backend failure is retried once against
    /// whichever backend is active after the failure is reported.
    pub async fn synthesize(
        &self,
        phonemes: &PhonemeSequence,
        voice_id: &str,
        params: &SynthesisParams,
    ) -> Result<SynthesisOutput, SynthesisFailure> {
        if voice_id.trim().is_empty() {
            return Err(SynthesisFailure::new(
                EngineError::InvalidRequest("voice id is empty".to_string()),
                voice_id,
                None,
                None,
            ));
        }
        if phonemes.is_empty() {
            return Err(SynthesisFailure::new(
                EngineError::InvalidRequest("phoneme sequence is empty".to_string()),
                voice_id,
                None,
                None,
            ));
        }

        self.maybe_refresh_manifest().await;

        let Some(checksum) = self
            .inner
            .voices
            .manifest()
            .get(voice_id)
            .map(|entry| entry.sha256.to_ascii_lowercase())
        else {
            return Err(SynthesisFailure::new(
                EngineError::VoiceNotFound {
                    voice_id: voice_id.to_string(),
                    reason: "not present in the voice manifest".to_string(),
                },
                voice_id,
                None,
                None,
            ));
        };

        let params = params.normalized();
        let fingerprint = Fingerprint::compute(phonemes, voice_id, &checksum, &params);
        let request = RenderRequest {
            phonemes: phonemes.clone(),
            voice_id: voice_id.to_string(),
            checksum,
            params,
            fingerprint,
        };

        let result = self
            .inner
            .results
            .lookup_or_compute(fingerprint, || render(self.inner.clone(), request))
            .await;

        match result {
            Ok((audio, source)) => {
                debug!(
                    voice_id,
                    fingerprint = %fingerprint,
                    source = ?source,
                    backend = %audio.produced_by(),
                    "Synthesis complete"
                );
                Ok(SynthesisOutput {
                    audio,
                    cached: source != ResultSource::Computed,
                    source,
                    fingerprint,
                })
            }
            Err(failure) => {
                warn!(
                    voice_id,
                    fingerprint = %fingerprint,
                    backend = failure.backend.as_deref().unwrap_or("none"),
                    category = %failure.category(),
                    error = %failure.error,
                    "Synthesis failed"
                );
                Err(failure)
            }
        }
    }

    /// Load the best backend before the first request arrives
    pub async fn warm_up(&self) -> EngineResult<String> {
        self.inner.manager.warm_up().await
    }

    /// Load and pin voices against eviction
    pub async fn preload_voices<I, S>(&self, voice_ids: I) -> PreloadReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.voices.preload(voice_ids).await
    }

    pub fn unpin_voice(&self, voice_id: &str) -> bool {
        self.inner.voices.unpin(voice_id)
    }

    /// Reload the voice manifest if its source changed
    pub async fn refresh_manifest(&self) -> EngineResult<bool> {
        let inner = self.inner.clone();
        *inner.last_manifest_check.lock() = Some(Instant::now());
        tokio::task::spawn_blocking(move || inner.voices.refresh_if_changed())
            .await
            .map_err(|e| EngineError::Io(format!("manifest refresh task failed: {e}")))?
    }

    async fn maybe_refresh_manifest(&self) {
        let due = {
            let mut last = self.inner.last_manifest_check.lock();
            let now = Instant::now();
            match *last {
                Some(at) if now.duration_since(at) < self.inner.manifest_check_interval => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if !due {
            return;
        }

        let inner = self.inner.clone();
        match tokio::task::spawn_blocking(move || inner.voices.refresh_if_changed()).await {
            Ok(Ok(true)) => info!("Voice manifest reloaded"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!(error = %e, "Voice manifest reload failed; keeping previous manifest"),
            Err(e) => warn!(error = %e, "Voice manifest reload task failed"),
        }
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            active_backend: self.inner.manager.active(),
            backends: self.inner.manager.status(),
            caches: self.cache_stats(),
            in_flight: self.inner.results.in_flight(),
            voices_in_manifest: self.inner.voices.manifest().len(),
        }
    }

    pub fn cache_stats(&self) -> EngineCacheStats {
        EngineCacheStats {
            voices: self.inner.voices.stats(),
            results: self.inner.results.stats(),
        }
    }

    pub fn fallback(&self) -> &FallbackManager {
        &self.inner.manager
    }

    pub fn voices(&self) -> &VoiceEmbeddingCache {
        &self.inner.voices
    }

    pub fn results(&self) -> &ResultCache<SynthesisFailure> {
        &self.inner.results
    }

    /// Unload every backend and drop cached audio
    pub async fn shutdown(&self) {
        self.inner.manager.shutdown().await;
        self.inner.results.clear();
        info!("Synthesis engine shut down");
    }
}

/// Everything a cache-miss computation needs, owned
struct RenderRequest {
    phonemes: PhonemeSequence,
    voice_id: String,
    /// Manifest checksum the fingerprint was computed with
    checksum: String,
    params: SynthesisParams,
    fingerprint: Fingerprint,
}

/// One cache-miss computation, attributed to the last backend slot tried
async fn render(
    inner: Arc<EngineInner>,
    request: RenderRequest,
) -> Result<Arc<AudioBuffer>, SynthesisFailure> {
    let mut attempted = None;
    let outcome = render_attempts(&inner, &request, &mut attempted).await;
    outcome.map_err(|error| {
        SynthesisFailure::new(error, request.voice_id, Some(request.fingerprint), attempted)
    })
}

/// Voice lookup, inference with a single retry, then encoding
async fn render_attempts(
    inner: &EngineInner,
    request: &RenderRequest,
    attempted: &mut Option<String>,
) -> EngineResult<Arc<AudioBuffer>> {
    let RenderRequest {
        phonemes,
        voice_id,
        checksum,
        params,
        ..
    } = request;

    let mut voice = inner.voices.get(voice_id).await?;
    if !voice.checksum().eq_ignore_ascii_case(checksum) {
        // Joined a load that started under the previous manifest
        debug!(voice_id = %voice_id, "Voice changed during request; reloading");
        voice = inner.voices.get(voice_id).await?;
        if !voice.checksum().eq_ignore_ascii_case(checksum) {
            return Err(EngineError::Integrity {
                voice_id: voice_id.clone(),
                expected: checksum.clone(),
                actual: voice.checksum().to_string(),
            });
        }
    }

    let inference = InferenceParams::from(params);
    let mut retried = false;

    loop {
        let lease = inner.manager.acquire().await?;
        *attempted = Some(lease.name().to_string());

        let started = Instant::now();
        let outcome = lease.handle().infer(phonemes, &voice, inference).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(raw) => {
                inner.manager.report_success(&lease, elapsed);
                debug!(
                    backend = %lease.name(),
                    voice_id = %voice_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    samples = raw.samples.len(),
                    "Inference complete"
                );
                let audio = AudioBuffer::encode(&raw, params.sample_rate, params.format, lease.name())?;
                return Ok(Arc::new(audio));
            }
            Err(error) => {
                inner.manager.report_failure(&lease, &error).await;
                if !error.is_transient() || retried {
                    return Err(error);
                }
                retried = true;
                warn!(
                    backend = %lease.name(),
                    voice_id = %voice_id,
                    error = %error,
                    "Inference failed; retrying once"
                );
            }
        }
    }
}

/// Builder for [`SynthesisEngine`]
#[derive(Default)]
pub struct SynthesisEngineBuilder {
    candidates: Vec<BackendCandidate>,
    policy: FallbackPolicy,
    backend_options: BackendOptions,
    loader: Option<Arc<dyn SessionLoader>>,
    voices: Option<VoiceEmbeddingCache>,
    voice_source: Option<(ManifestSource, VoiceCacheConfig)>,
    result_cache_bytes: Option<u64>,
    manifest_check_interval: Option<Duration>,
}

impl SynthesisEngineBuilder {
    pub fn candidate(mut self, candidate: BackendCandidate) -> Self {
        self.candidates.push(candidate);
        self
    }

    pub fn candidates(mut self, candidates: impl IntoIterator<Item = BackendCandidate>) -> Self {
        self.candidates.extend(candidates);
        self
    }

    pub fn policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn backend_options(mut self, options: BackendOptions) -> Self {
        self.backend_options = options;
        self
    }

    /// Session loader for the native runtime; defaults to the one compiled in
    pub fn session_loader(mut self, loader: Arc<dyn SessionLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Use an already constructed voice cache
    pub fn voice_cache(mut self, cache: VoiceEmbeddingCache) -> Self {
        self.voices = Some(cache);
        self
    }

    /// Build the voice cache over a fixed manifest
    pub fn voice_manifest(self, manifest: VoiceManifest, config: VoiceCacheConfig) -> Self {
        self.voice_cache(VoiceEmbeddingCache::new(manifest, config))
    }

    /// Build the voice cache over a manifest file or voices directory that is
    /// watched for changes
    pub fn voice_source(mut self, source: ManifestSource, config: VoiceCacheConfig) -> Self {
        self.voice_source = Some((source, config));
        self
    }

    pub fn voices_dir(self, dir: impl Into<PathBuf>, config: VoiceCacheConfig) -> Self {
        self.voice_source(ManifestSource::Directory(dir.into()), config)
    }

    pub fn result_cache_bytes(mut self, bytes: u64) -> Self {
        self.result_cache_bytes = Some(bytes);
        self
    }

    pub fn manifest_check_interval(mut self, interval: Duration) -> Self {
        self.manifest_check_interval = Some(interval);
        self
    }

    pub fn build(self) -> EngineResult<SynthesisEngine> {
        let voices = match (self.voices, self.voice_source) {
            (Some(cache), _) => cache,
            (None, Some((source, config))) => VoiceEmbeddingCache::from_source(source, config)?,
            (None, None) => {
                return Err(EngineError::InvalidConfiguration(
                    "a voice manifest or voices directory is required".to_string(),
                ));
            }
        };

        let factory = match self.loader {
            Some(loader) => BackendFactory::new(self.backend_options, loader),
            None => BackendFactory::with_default_loader(self.backend_options),
        };
        let backends = self.candidates.len();
        let manager = FallbackManager::new(self.candidates, self.policy, factory)?;
        let results =
            ResultCache::new(self.result_cache_bytes.unwrap_or(DEFAULT_RESULT_CACHE_BYTES));

        info!(
            backends,
            voices = voices.manifest().len(),
            voice_cache_bytes = voices.config().capacity_bytes,
            result_cache_bytes = results.stats().capacity_bytes,
            "Synthesis engine initialized"
        );

        Ok(SynthesisEngine {
            inner: Arc::new(EngineInner {
                manager,
                voices,
                results,
                manifest_check_interval: self
                    .manifest_check_interval
                    .unwrap_or(DEFAULT_MANIFEST_CHECK_INTERVAL),
                last_manifest_check: Mutex::new(None),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::native::AcousticSession;
    use crate::core::cache::{ManifestEntry, sha256_hex};
    use crate::core::audio::AudioFormat;
    use crate::core::model::{ClassifierConfig, ModelDescriptor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIM: usize = 4;

    struct ToneSession {
        runs: Arc<AtomicUsize>,
        failures_left: Arc<AtomicUsize>,
    }

    impl AcousticSession for ToneSession {
        fn run(&mut self, tokens: &[i64], style: &[f32], speed: f32) -> anyhow::Result<Vec<f32>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("device lost");
            }
            Ok(vec![style[0] * speed * 0.5; tokens.len() * 240])
        }
    }

    struct ToneLoader {
        runs: Arc<AtomicUsize>,
        failures_left: Arc<AtomicUsize>,
    }

    impl SessionLoader for ToneLoader {
        fn load(
            &self,
            _descriptor: &ModelDescriptor,
            _options: &BackendOptions,
        ) -> anyhow::Result<Box<dyn AcousticSession>> {
            Ok(Box::new(ToneSession {
                runs: self.runs.clone(),
                failures_left: self.failures_left.clone(),
            }))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        runs: Arc<AtomicUsize>,
        failures_left: Arc<AtomicUsize>,
        engine: SynthesisEngine,
    }

    fn harness(policy: FallbackPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("kokoro.onnx");
        std::fs::write(&model, [0x08, 0x07, 0x12, 0x04, b't', b'e', b's', b't']).unwrap();
        let descriptor = classify(&model, &ClassifierConfig::default()).unwrap();

        let voice_bytes: Vec<u8> = [0.4f32; DIM * 2]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let voice_path = dir.path().join("af_heart.bin");
        std::fs::write(&voice_path, &voice_bytes).unwrap();

        let mut manifest = VoiceManifest::default();
        manifest.voices.insert(
            "af_heart".to_string(),
            ManifestEntry {
                path: voice_path,
                sha256: sha256_hex(&voice_bytes),
                size_bytes: Some(voice_bytes.len() as u64),
            },
        );

        let runs = Arc::new(AtomicUsize::new(0));
        let failures_left = Arc::new(AtomicUsize::new(0));
        let engine = SynthesisEngine::builder()
            .candidate(BackendCandidate::new("primary", descriptor.clone()).with_priority(0))
            .candidate(BackendCandidate::new("secondary", descriptor).with_priority(1))
            .policy(policy)
            .session_loader(Arc::new(ToneLoader {
                runs: runs.clone(),
                failures_left: failures_left.clone(),
            }))
            .voice_manifest(
                manifest,
                VoiceCacheConfig {
                    capacity_bytes: 1 << 20,
                    embedding_dim: DIM,
                },
            )
            .result_cache_bytes(1 << 20)
            .build()
            .unwrap();

        Harness {
            _dir: dir,
            runs,
            failures_left,
            engine,
        }
    }

    fn phonemes() -> PhonemeSequence {
        PhonemeSequence::new("hɛloʊ", vec![50, 83, 54, 156, 57])
    }

    #[tokio::test]
    async fn test_second_request_is_cached() {
        let h = harness(FallbackPolicy::default());
        let params = SynthesisParams::default();

        let first = h.engine.synthesize(&phonemes(), "af_heart", &params).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.audio.produced_by(), "primary");
        assert_eq!(first.audio.format(), AudioFormat::Pcm16);

        let second = h.engine.synthesize(&phonemes(), "af_heart", &params).await.unwrap();
        assert!(second.cached);
        assert!(Arc::ptr_eq(&first.audio, &second.audio));
        assert_eq!(h.runs.load(Ordering::SeqCst), 1);

        let stats = h.engine.cache_stats();
        assert_eq!(stats.results.misses, 1);
        assert_eq!(stats.voices.misses, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let h = harness(FallbackPolicy::default());
        h.failures_left.store(1, Ordering::SeqCst);

        let output = h
            .engine
            .synthesize(&phonemes(), "af_heart", &SynthesisParams::default())
            .await
            .unwrap();
        assert!(!output.cached);
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);
        assert_eq!(h.engine.status().backends[0].failure_count, 1);
    }

    #[tokio::test]
    async fn test_second_transient_failure_surfaces() {
        let h = harness(FallbackPolicy::default());
        h.failures_left.store(2, Ordering::SeqCst);

        let failure = h
            .engine
            .synthesize(&phonemes(), "af_heart", &SynthesisParams::default())
            .await
            .unwrap_err();
        assert!(failure.error.is_transient());
        assert_eq!(failure.backend.as_deref(), Some("primary"));
        assert!(failure.fingerprint.is_some());
        assert_eq!(h.runs.load(Ordering::SeqCst), 2);
        assert!(!h.engine.results().contains(&failure.fingerprint.unwrap()));
    }

    #[tokio::test]
    async fn test_threshold_moves_traffic_to_next_backend() {
        let h = harness(FallbackPolicy {
            failure_threshold: 2,
            ..Default::default()
        });
        h.failures_left.store(2, Ordering::SeqCst);

        let failure = h
            .engine
            .synthesize(&phonemes(), "af_heart", &SynthesisParams::default())
            .await
            .unwrap_err();
        assert!(failure.error.is_transient());

        let output = h
            .engine
            .synthesize(&phonemes(), "af_heart", &SynthesisParams::default())
            .await
            .unwrap();
        assert_eq!(output.audio.produced_by(), "secondary");
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected_before_inference() {
        let h = harness(FallbackPolicy::default());

        let empty_voice = h
            .engine
            .synthesize(&phonemes(), " ", &SynthesisParams::default())
            .await
            .unwrap_err();
        assert!(matches!(empty_voice.error, EngineError::InvalidRequest(_)));
        assert!(empty_voice.fingerprint.is_none());

        let empty_phonemes = h
            .engine
            .synthesize(
                &PhonemeSequence::new("", Vec::new()),
                "af_heart",
                &SynthesisParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(empty_phonemes.error, EngineError::InvalidRequest(_)));
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_voice_is_not_retried() {
        let h = harness(FallbackPolicy::default());
        let failure = h
            .engine
            .synthesize(&phonemes(), "nobody", &SynthesisParams::default())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, EngineError::VoiceNotFound { .. }));
        assert_eq!(failure.backend, None);
        assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_output_is_resampled_to_requested_rate() {
        let h = harness(FallbackPolicy::default());
        let params = SynthesisParams {
            sample_rate: 16_000,
            format: AudioFormat::Float32,
            ..Default::default()
        };
        let output = h.engine.synthesize(&phonemes(), "af_heart", &params).await.unwrap();
        assert_eq!(output.audio.sample_rate(), 16_000);
        assert_eq!(output.audio.bit_depth(), 32);
        assert_eq!(output.audio.duration().as_millis(), 50);
    }

    #[test]
    fn test_builder_requires_voices() {
        let err = SynthesisEngine::builder().build().err().unwrap();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
    }
}
