//! Inference backends
//!
//! A backend turns a phoneme sequence and a voice embedding into raw audio.
//! Two execution strategies exist and the set is closed:
//!
//! - [`NativeRuntimeBackend`]: weights loaded into this process, blocking
//!   forward pass on the blocking pool
//! - [`HelperProcessBackend`]: an external helper binary driven through
//!   temporary files, with a hard wall-clock timeout
//!
//! [`BackendHandle`] wraps exactly one of them and is what the rest of the
//! core holds. The variant is chosen once, by [`BackendFactory`].

pub mod factory;
pub mod helper;
pub mod native;
#[cfg(feature = "onnx")]
pub mod onnx;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::audio::RawAudio;
use crate::core::cache::VoiceEmbedding;
use crate::core::model::{ModelDescriptor, ModelFormat};
use crate::core::types::{DEFAULT_SAMPLE_RATE, InferenceParams, PhonemeSequence};
use crate::errors::{EngineError, EngineResult};

pub use factory::{BackendFactory, SelectionPlan, SelectionRationale};
pub use helper::HelperProcessBackend;
pub use native::{AcousticSession, NativeRuntimeBackend, SessionLoader, default_session_loader};
#[cfg(feature = "onnx")]
pub use onnx::OnnxSessionLoader;

/// Default hard timeout for one helper invocation
pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_millis(5000);

/// Execution strategy of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendVariant {
    /// In-process numeric runtime
    NativeRuntime,
    /// Out-of-process helper binary
    HelperProcess,
}

impl BackendVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendVariant::NativeRuntime => "native-runtime",
            BackendVariant::HelperProcess => "helper-process",
        }
    }

    /// Model format this variant runs without conversion
    pub fn native_format(&self) -> ModelFormat {
        match self {
            BackendVariant::NativeRuntime => ModelFormat::NumericRuntimeNative,
            BackendVariant::HelperProcess => ModelFormat::HelperBinaryNative,
        }
    }

    pub fn alternate(&self) -> BackendVariant {
        match self {
            BackendVariant::NativeRuntime => BackendVariant::HelperProcess,
            BackendVariant::HelperProcess => BackendVariant::NativeRuntime,
        }
    }

    pub fn for_format(format: ModelFormat) -> BackendVariant {
        match format {
            ModelFormat::NumericRuntimeNative => BackendVariant::NativeRuntime,
            ModelFormat::HelperBinaryNative => BackendVariant::HelperProcess,
        }
    }

    /// Whether this variant can run the described model
    pub fn is_compatible(&self, descriptor: &ModelDescriptor) -> bool {
        descriptor.is_heuristic() || self.native_format() == descriptor.format()
    }
}

impl std::fmt::Display for BackendVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured backend preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendPreference {
    #[default]
    Auto,
    #[serde(alias = "variant-a", alias = "native", alias = "onnx")]
    NativeRuntime,
    #[serde(alias = "variant-b", alias = "helper", alias = "process")]
    HelperProcess,
}

impl BackendPreference {
    /// The forced variant, or `None` for auto-detection
    pub fn variant(&self) -> Option<BackendVariant> {
        match self {
            BackendPreference::Auto => None,
            BackendPreference::NativeRuntime => Some(BackendVariant::NativeRuntime),
            BackendPreference::HelperProcess => Some(BackendVariant::HelperProcess),
        }
    }
}

impl FromStr for BackendPreference {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "" => Ok(BackendPreference::Auto),
            "native-runtime" | "native_runtime" | "variant-a" | "native" | "onnx" => {
                Ok(BackendPreference::NativeRuntime)
            }
            "helper-process" | "helper_process" | "variant-b" | "helper" | "process" => {
                Ok(BackendPreference::HelperProcess)
            }
            other => Err(EngineError::InvalidConfiguration(format!(
                "Unsupported backend preference: {other}. Supported values: auto, native-runtime (variant-a), helper-process (variant-b)"
            ))),
        }
    }
}

impl std::fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendPreference::Auto => f.write_str("auto"),
            BackendPreference::NativeRuntime => f.write_str("native-runtime"),
            BackendPreference::HelperProcess => f.write_str("helper-process"),
        }
    }
}

/// Options shared by both backend variants
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Helper executable (required by the helper variant)
    pub helper_path: Option<PathBuf>,
    /// Arguments placed before the generated ones, e.g. a script for an interpreter
    pub helper_args: Vec<String>,
    /// Hard wall-clock budget for one helper invocation
    pub helper_timeout: Duration,
    /// Parent directory for per-call temporary directories
    pub scratch_dir: Option<PathBuf>,
    /// Number of in-process sessions per model
    pub pool_size: usize,
    /// Intra-op threads for the numeric runtime
    pub num_threads: Option<usize>,
    /// Native output rate of the acoustic model
    pub sample_rate: u32,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            helper_path: None,
            helper_args: Vec::new(),
            helper_timeout: DEFAULT_HELPER_TIMEOUT,
            scratch_dir: None,
            pool_size: 1,
            num_threads: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

/// Capacity planning information about a loaded backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendDescription {
    pub device_type: String,
    pub approx_memory_bytes: u64,
    pub supports_streaming: bool,
}

/// Capability set shared by every backend variant
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn variant(&self) -> BackendVariant;

    fn descriptor(&self) -> &ModelDescriptor;

    /// Run one forward pass.
    ///
    /// Deterministic for identical inputs. The embedding is only read.
    async fn infer(
        &self,
        phonemes: &PhonemeSequence,
        voice: &VoiceEmbedding,
        params: InferenceParams,
    ) -> EngineResult<RawAudio>;

    /// Never fails
    fn describe(&self) -> BackendDescription;

    /// Release resources. Calling this twice is a programmer error; the
    /// second call logs a warning and does nothing.
    async fn unload(&self);
}

/// A loaded backend bound to exactly one model
pub enum BackendHandle {
    NativeRuntime(NativeRuntimeBackend),
    HelperProcess(HelperProcessBackend),
}

impl BackendHandle {
    /// Load `descriptor` with the given variant.
    ///
    /// Safe to retry: a failed load leaves nothing behind.
    pub async fn load(
        variant: BackendVariant,
        descriptor: &ModelDescriptor,
        options: &BackendOptions,
        loader: &Arc<dyn SessionLoader>,
    ) -> EngineResult<Self> {
        match variant {
            BackendVariant::NativeRuntime => {
                NativeRuntimeBackend::load(descriptor, options, loader.clone())
                    .await
                    .map(BackendHandle::NativeRuntime)
            }
            BackendVariant::HelperProcess => {
                HelperProcessBackend::load(descriptor, options)
                    .await
                    .map(BackendHandle::HelperProcess)
            }
        }
    }

    fn inner(&self) -> &dyn InferenceBackend {
        match self {
            BackendHandle::NativeRuntime(backend) => backend,
            BackendHandle::HelperProcess(backend) => backend,
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("variant", &self.variant())
            .field("model", &self.descriptor().path())
            .finish()
    }
}

#[async_trait]
impl InferenceBackend for BackendHandle {
    fn variant(&self) -> BackendVariant {
        self.inner().variant()
    }

    fn descriptor(&self) -> &ModelDescriptor {
        self.inner().descriptor()
    }

    async fn infer(
        &self,
        phonemes: &PhonemeSequence,
        voice: &VoiceEmbedding,
        params: InferenceParams,
    ) -> EngineResult<RawAudio> {
        self.inner().infer(phonemes, voice, params).await
    }

    fn describe(&self) -> BackendDescription {
        self.inner().describe()
    }

    async fn unload(&self) {
        self.inner().unload().await
    }
}
