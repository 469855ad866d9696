use serde::Deserialize;
use std::path::PathBuf;

use crate::core::backend::BackendPreference;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// backends:
///   preference: auto
///   model_dir: "/opt/voxcore/models"
///   pool_size: 2
///   sample_rate: 24000
///   models:
///     - name: "kokoro-onnx"
///       path: "/opt/voxcore/models/kokoro-v1.0.onnx"
///       priority: 0
///     - name: "kokoro-gguf"
///       path: "/opt/voxcore/models/kokoro-q8_0.gguf"
///       preference: helper-process
///       priority: 1
///
/// fallback:
///   enabled: true
///   failure_threshold: 3
///   failure_window_ms: 60000
///   quarantine_cooldown_ms: 30000
///
/// cache:
///   voice_bytes: 67108864
///   result_bytes: 268435456
///
/// helper:
///   path: "/usr/local/bin/kokoro-helper"
///   args: []
///   timeout_ms: 5000
///   scratch_dir: "/var/tmp/voxcore"
///
/// classifier:
///   heuristic_size_threshold_bytes: 104857600
///
/// voices:
///   manifest: "/opt/voxcore/voices/manifest.json"
///   embedding_dim: 256
///   preload: ["af_heart"]
///   check_interval_ms: 5000
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub backends: Option<BackendsYaml>,
    pub fallback: Option<FallbackYaml>,
    pub cache: Option<CacheYaml>,
    pub helper: Option<HelperYaml>,
    pub classifier: Option<ClassifierYaml>,
    pub voices: Option<VoicesYaml>,
}

/// Backend selection from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BackendsYaml {
    pub preference: Option<BackendPreference>,
    pub model_dir: Option<String>,
    pub pool_size: Option<usize>,
    pub num_threads: Option<usize>,
    /// Native output rate of the configured models
    pub sample_rate: Option<u32>,
    pub models: Option<Vec<ModelYaml>>,
}

/// One backend slot from YAML
#[derive(Debug, Clone, Deserialize)]
pub struct ModelYaml {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub preference: Option<BackendPreference>,
    #[serde(default)]
    pub priority: Option<u32>,
}

/// Fallback policy from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FallbackYaml {
    /// Allow the alternate backend variant when the first fails to load
    pub enabled: Option<bool>,
    pub failure_threshold: Option<u32>,
    pub failure_window_ms: Option<u64>,
    pub quarantine_cooldown_ms: Option<u64>,
}

/// Cache budgets from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheYaml {
    pub voice_bytes: Option<u64>,
    pub result_bytes: Option<u64>,
}

/// Helper binary settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HelperYaml {
    pub path: Option<String>,
    pub args: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,
    pub scratch_dir: Option<String>,
}

/// Classifier settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ClassifierYaml {
    pub heuristic_size_threshold_bytes: Option<u64>,
}

/// Voice manifest settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VoicesYaml {
    pub manifest: Option<String>,
    pub dir: Option<String>,
    pub embedding_dim: Option<usize>,
    pub preload: Option<Vec<String>>,
    pub check_interval_ms: Option<u64>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Required fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}
