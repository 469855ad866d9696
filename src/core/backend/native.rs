//! In-process numeric runtime backend
//!
//! Sessions are not assumed to be reentrant. Each backend owns a small pool
//! of `pool_size` sessions for the same model, each behind its own mutex, and
//! requests are spread round-robin across them. With `pool_size = 1` every
//! forward pass is serialized on one session.
//!
//! The forward pass is a blocking call and runs on tokio's blocking pool so
//! it never stalls the async workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{BackendDescription, BackendOptions, BackendVariant, InferenceBackend};
use crate::core::audio::RawAudio;
use crate::core::cache::VoiceEmbedding;
use crate::core::model::ModelDescriptor;
use crate::core::types::{InferenceParams, PhonemeSequence};
use crate::errors::{EngineError, EngineResult};

/// One loaded copy of a model's weights
pub trait AcousticSession: Send {
    /// Blocking forward pass returning mono samples at the model's rate
    fn run(&mut self, tokens: &[i64], style: &[f32], speed: f32) -> anyhow::Result<Vec<f32>>;
}

/// Creates sessions for a model file
pub trait SessionLoader: Send + Sync {
    fn load(
        &self,
        descriptor: &ModelDescriptor,
        options: &BackendOptions,
    ) -> anyhow::Result<Box<dyn AcousticSession>>;
}

/// Loader used when the crate is built without a numeric runtime
#[cfg(not(feature = "onnx"))]
struct UnavailableSessionLoader;

#[cfg(not(feature = "onnx"))]
impl SessionLoader for UnavailableSessionLoader {
    fn load(
        &self,
        _descriptor: &ModelDescriptor,
        _options: &BackendOptions,
    ) -> anyhow::Result<Box<dyn AcousticSession>> {
        anyhow::bail!("numeric runtime support is not compiled in (enable the `onnx` feature)")
    }
}

/// The session loader for this build
pub fn default_session_loader() -> Arc<dyn SessionLoader> {
    #[cfg(feature = "onnx")]
    {
        Arc::new(super::onnx::OnnxSessionLoader::default())
    }
    #[cfg(not(feature = "onnx"))]
    {
        Arc::new(UnavailableSessionLoader)
    }
}

type SessionSlot = Arc<Mutex<Option<Box<dyn AcousticSession>>>>;

/// Backend running the acoustic model inside this process
pub struct NativeRuntimeBackend {
    descriptor: ModelDescriptor,
    sessions: Vec<SessionSlot>,
    next: AtomicUsize,
    sample_rate: u32,
    unloaded: AtomicBool,
}

impl std::fmt::Debug for NativeRuntimeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRuntimeBackend")
            .field("descriptor", &self.descriptor)
            .field("sessions", &self.sessions.len())
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

impl NativeRuntimeBackend {
    pub async fn load(
        descriptor: &ModelDescriptor,
        options: &BackendOptions,
        loader: Arc<dyn SessionLoader>,
    ) -> EngineResult<Self> {
        let pool_size = options.pool_size.max(1);
        info!(
            model = %descriptor.path().display(),
            pool_size,
            "Loading native runtime sessions"
        );

        // Load on a blocking thread; a failure drops every session created so far
        let sessions = tokio::task::spawn_blocking({
            let descriptor = descriptor.clone();
            let options = options.clone();
            move || {
                (0..pool_size)
                    .map(|_| loader.load(&descriptor, &options))
                    .collect::<anyhow::Result<Vec<_>>>()
            }
        })
        .await
        .map_err(|e| EngineError::Load {
            variant: BackendVariant::NativeRuntime,
            reason: format!("session loader panicked: {e}"),
        })?
        .map_err(|e| EngineError::Load {
            variant: BackendVariant::NativeRuntime,
            reason: format!("{e:#}"),
        })?;

        Ok(Self {
            descriptor: descriptor.clone(),
            sessions: sessions
                .into_iter()
                .map(|session| Arc::new(Mutex::new(Some(session))))
                .collect(),
            next: AtomicUsize::new(0),
            sample_rate: options.sample_rate,
            unloaded: AtomicBool::new(false),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.sessions.len()
    }

    fn inference_error(reason: impl Into<String>) -> EngineError {
        EngineError::Inference {
            variant: BackendVariant::NativeRuntime,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl InferenceBackend for NativeRuntimeBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::NativeRuntime
    }

    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    async fn infer(
        &self,
        phonemes: &PhonemeSequence,
        voice: &VoiceEmbedding,
        params: InferenceParams,
    ) -> EngineResult<RawAudio> {
        if phonemes.tokens().is_empty() {
            return Err(EngineError::InvalidRequest(
                "native runtime requires token ids".to_string(),
            ));
        }
        if self.unloaded.load(Ordering::Acquire) {
            return Err(Self::inference_error("backend has been unloaded"));
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let slot = self.sessions[index].clone();
        let tokens = phonemes.tokens().to_vec();
        let style = voice.style_for(phonemes.len()).to_vec();
        let speed = params.speed;
        let started = Instant::now();

        let samples = tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock();
            let session = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("session released during unload"))?;
            session.run(&tokens, &style, speed)
        })
        .await
        .map_err(|e| Self::inference_error(format!("inference task failed: {e}")))?
        .map_err(|e| Self::inference_error(format!("{e:#}")))?;

        if samples.is_empty() {
            return Err(Self::inference_error("model produced no audio"));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(Self::inference_error("model produced non-finite samples"));
        }

        debug!(
            session = index,
            samples = samples.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Native runtime inference complete"
        );

        Ok(RawAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }

    fn describe(&self) -> BackendDescription {
        BackendDescription {
            device_type: "cpu".to_string(),
            approx_memory_bytes: self
                .descriptor
                .size_bytes()
                .saturating_mul(self.sessions.len() as u64),
            supports_streaming: false,
        }
    }

    async fn unload(&self) {
        if self.unloaded.swap(true, Ordering::AcqRel) {
            warn!(
                model = %self.descriptor.path().display(),
                "unload called twice on native runtime backend; ignoring"
            );
            return;
        }

        let sessions = self.sessions.clone();
        // Taking a session waits for any forward pass still holding it
        let released = tokio::task::spawn_blocking(move || {
            sessions
                .iter()
                .filter_map(|slot| slot.lock().take())
                .count()
        })
        .await
        .unwrap_or(0);

        info!(
            model = %self.descriptor.path().display(),
            sessions = released,
            "Native runtime backend unloaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{ClassifierConfig, classify};

    struct CountingSession {
        id: usize,
    }

    impl AcousticSession for CountingSession {
        fn run(&mut self, tokens: &[i64], style: &[f32], speed: f32) -> anyhow::Result<Vec<f32>> {
            let level = style.first().copied().unwrap_or(0.0) * speed;
            let mut out = vec![level; tokens.len() * 10];
            out[0] = self.id as f32 / 100.0;
            Ok(out)
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
        fail: bool,
    }

    impl SessionLoader for CountingLoader {
        fn load(
            &self,
            _descriptor: &ModelDescriptor,
            _options: &BackendOptions,
        ) -> anyhow::Result<Box<dyn AcousticSession>> {
            if self.fail {
                anyhow::bail!("corrupt weights");
            }
            let id = self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession { id }))
        }
    }

    fn descriptor(dir: &tempfile::TempDir) -> ModelDescriptor {
        let path = dir.path().join("kokoro-v1.0.onnx");
        std::fs::write(&path, [0x08, 0x07, 0x12, 0x04, b't', b'e', b's', b't']).unwrap();
        classify(&path, &ClassifierConfig::default()).unwrap()
    }

    fn voice() -> VoiceEmbedding {
        VoiceEmbedding::from_values("af_heart", vec![0.5; 4 * 2], 4, "00".to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_pool_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            fail: false,
        });
        let options = BackendOptions {
            pool_size: 2,
            ..Default::default()
        };
        let backend = NativeRuntimeBackend::load(&descriptor(&dir), &options, loader.clone())
            .await
            .unwrap();
        assert_eq!(backend.pool_size(), 2);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

        let phonemes = PhonemeSequence::new("ab", vec![1, 2]);
        let params = InferenceParams { speed: 1.0 };
        let first = backend.infer(&phonemes, &voice(), params).await.unwrap();
        let second = backend.infer(&phonemes, &voice(), params).await.unwrap();
        assert_ne!(first.samples[0], second.samples[0]);
        assert_eq!(first.samples.len(), 20);
    }

    #[tokio::test]
    async fn test_load_failure_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            fail: true,
        });
        let err = NativeRuntimeBackend::load(&descriptor(&dir), &BackendOptions::default(), loader)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Load {
                variant: BackendVariant::NativeRuntime,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unload_twice_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(CountingLoader {
            loads: AtomicUsize::new(0),
            fail: false,
        });
        let backend = NativeRuntimeBackend::load(&descriptor(&dir), &BackendOptions::default(), loader)
            .await
            .unwrap();
        backend.unload().await;
        backend.unload().await;

        let err = backend
            .infer(
                &PhonemeSequence::new("a", vec![1]),
                &voice(),
                InferenceParams { speed: 1.0 },
            )
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[cfg(not(feature = "onnx"))]
    #[tokio::test]
    async fn test_default_loader_without_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let err = NativeRuntimeBackend::load(
            &descriptor(&dir),
            &BackendOptions::default(),
            default_session_loader(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("onnx"));
    }
}
