//! Configuration for the synthesis engine
//!
//! Configuration comes from three sources: defaults, `VOXCORE_*` environment
//! variables and an optional YAML file. Priority: YAML > ENV > defaults.
//! `.env` files are loaded by the binary before any of this runs.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Applying YAML overrides on top of the environment
//!
//! # Example
//! ```rust,no_run
//! use voxcore::config::EngineConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_file(&PathBuf::from("voxcore.yaml"))?;
//! println!("{} configured backend(s)", config.backends.len());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::core::backend::{BackendOptions, BackendPreference, DEFAULT_HELPER_TIMEOUT};
use crate::core::cache::{
    DEFAULT_EMBEDDING_DIM, DEFAULT_RESULT_CACHE_BYTES, DEFAULT_VOICE_CACHE_BYTES, ManifestSource,
    VoiceCacheConfig,
};
use crate::core::engine::DEFAULT_MANIFEST_CHECK_INTERVAL;
use crate::core::fallback::FallbackPolicy;
use crate::core::model::{ClassifierConfig, DEFAULT_HEURISTIC_SIZE_THRESHOLD};
use crate::core::types::{DEFAULT_SAMPLE_RATE, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
use crate::errors::{EngineError, EngineResult};

mod env;
mod merge;
mod yaml;

pub use yaml::YamlConfig;

/// One explicitly configured backend slot
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    pub model: PathBuf,
    /// Overrides the engine-wide preference for this slot
    pub preference: Option<BackendPreference>,
    pub priority: Option<u32>,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Backends
    pub backends: Vec<BackendConfig>,
    /// Directory scanned for additional models
    pub model_dir: Option<PathBuf>,
    pub backend_preference: BackendPreference,
    pub session_pool_size: usize,
    pub num_threads: Option<usize>,
    pub model_sample_rate: u32,

    // Fallback
    pub allow_fallback: bool,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub quarantine_cooldown: Duration,

    // Caches
    pub voice_cache_bytes: u64,
    pub result_cache_bytes: u64,

    // Helper binary
    pub helper_path: Option<PathBuf>,
    pub helper_args: Vec<String>,
    pub helper_timeout: Duration,
    pub scratch_dir: Option<PathBuf>,

    // Classifier
    pub heuristic_size_threshold_bytes: u64,

    // Voices
    pub voice_manifest: Option<PathBuf>,
    pub voices_dir: Option<PathBuf>,
    pub embedding_dim: usize,
    pub preload_voices: Vec<String>,
    pub manifest_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let policy = FallbackPolicy::default();
        Self {
            backends: Vec::new(),
            model_dir: None,
            backend_preference: BackendPreference::Auto,
            session_pool_size: 1,
            num_threads: None,
            model_sample_rate: DEFAULT_SAMPLE_RATE,
            allow_fallback: policy.allow_fallback,
            failure_threshold: policy.failure_threshold,
            failure_window: policy.failure_window,
            quarantine_cooldown: policy.quarantine_cooldown,
            voice_cache_bytes: DEFAULT_VOICE_CACHE_BYTES,
            result_cache_bytes: DEFAULT_RESULT_CACHE_BYTES,
            helper_path: None,
            helper_args: Vec::new(),
            helper_timeout: DEFAULT_HELPER_TIMEOUT,
            scratch_dir: None,
            heuristic_size_threshold_bytes: DEFAULT_HEURISTIC_SIZE_THRESHOLD,
            voice_manifest: None,
            voices_dir: None,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            preload_voices: Vec::new(),
            manifest_check_interval: DEFAULT_MANIFEST_CHECK_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = env::load_from_env(Self::default())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable fallback
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables
    /// 3. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.backends.is_empty() && self.model_dir.is_none() {
            return Err("at least one backend or a model_dir must be configured".into());
        }
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.name.trim().is_empty() {
                return Err(format!("backend #{i} has an empty name").into());
            }
            if self.backends[..i].iter().any(|b| b.name == backend.name) {
                return Err(format!("duplicate backend name: {}", backend.name).into());
            }
        }
        if self.failure_threshold == 0 {
            return Err("fallback.failure_threshold must be at least 1".into());
        }
        if self.failure_window.is_zero() {
            return Err("fallback.failure_window_ms must be greater than 0".into());
        }
        if self.helper_timeout.is_zero() {
            return Err("helper.timeout_ms must be greater than 0".into());
        }
        if self.session_pool_size == 0 {
            return Err("backends.pool_size must be at least 1".into());
        }
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.model_sample_rate) {
            return Err(format!(
                "backends.sample_rate must be between {MIN_SAMPLE_RATE} and {MAX_SAMPLE_RATE}, got {}",
                self.model_sample_rate
            )
            .into());
        }
        if self.embedding_dim == 0 {
            return Err("voices.embedding_dim must be greater than 0".into());
        }
        if self.voice_manifest.is_none() && self.voices_dir.is_none() {
            return Err("either voices.manifest or voices.dir must be configured".into());
        }
        if self.helper_path.is_none()
            && self.backend_preference == BackendPreference::HelperProcess
        {
            return Err("helper-process preference requires helper.path".into());
        }
        Ok(())
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        FallbackPolicy {
            failure_threshold: self.failure_threshold,
            failure_window: self.failure_window,
            quarantine_cooldown: self.quarantine_cooldown,
            allow_fallback: self.allow_fallback,
        }
    }

    /// Backend options; intra-op threads default to an even share of the
    /// machine's cores across the session pool
    pub fn backend_options(&self) -> BackendOptions {
        let pool_size = self.session_pool_size.max(1);
        BackendOptions {
            helper_path: self.helper_path.clone(),
            helper_args: self.helper_args.clone(),
            helper_timeout: self.helper_timeout,
            scratch_dir: self.scratch_dir.clone(),
            pool_size,
            num_threads: Some(
                self.num_threads
                    .unwrap_or_else(|| (num_cpus::get() / pool_size).max(1)),
            ),
            sample_rate: self.model_sample_rate,
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            heuristic_size_threshold_bytes: self.heuristic_size_threshold_bytes,
        }
    }

    pub fn voice_cache_config(&self) -> VoiceCacheConfig {
        VoiceCacheConfig {
            capacity_bytes: self.voice_cache_bytes,
            embedding_dim: self.embedding_dim,
        }
    }

    /// The manifest file if configured, otherwise the voices directory
    pub fn manifest_source(&self) -> EngineResult<ManifestSource> {
        match (&self.voice_manifest, &self.voices_dir) {
            (Some(path), _) => Ok(ManifestSource::File(path.clone())),
            (None, Some(dir)) => Ok(ManifestSource::Directory(dir.clone())),
            (None, None) => Err(EngineError::InvalidConfiguration(
                "no voice manifest or voices directory configured".to_string(),
            )),
        }
    }
}
