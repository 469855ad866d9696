use std::path::PathBuf;
use std::time::Duration;

use super::env::load_from_env;
use super::yaml::YamlConfig;
use super::{BackendConfig, EngineConfig};

/// Build the final configuration: defaults, then environment, then YAML
pub(super) fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = load_from_env(EngineConfig::default())?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(backends) = yaml.backends {
        if let Some(preference) = backends.preference {
            config.backend_preference = preference;
        }
        if let Some(dir) = backends.model_dir {
            config.model_dir = Some(PathBuf::from(dir));
        }
        if let Some(pool_size) = backends.pool_size {
            config.session_pool_size = pool_size;
        }
        if let Some(threads) = backends.num_threads {
            config.num_threads = Some(threads);
        }
        if let Some(rate) = backends.sample_rate {
            config.model_sample_rate = rate;
        }
        // A model list in YAML replaces the one derived from VOXCORE_MODEL
        if let Some(models) = backends.models {
            config.backends = models
                .into_iter()
                .map(|model| BackendConfig {
                    name: model.name,
                    model: PathBuf::from(model.path),
                    preference: model.preference,
                    priority: model.priority,
                })
                .collect();
        }
    }

    if let Some(fallback) = yaml.fallback {
        if let Some(enabled) = fallback.enabled {
            config.allow_fallback = enabled;
        }
        if let Some(threshold) = fallback.failure_threshold {
            config.failure_threshold = threshold;
        }
        if let Some(ms) = fallback.failure_window_ms {
            config.failure_window = Duration::from_millis(ms);
        }
        if let Some(ms) = fallback.quarantine_cooldown_ms {
            config.quarantine_cooldown = Duration::from_millis(ms);
        }
    }

    if let Some(cache) = yaml.cache {
        if let Some(bytes) = cache.voice_bytes {
            config.voice_cache_bytes = bytes;
        }
        if let Some(bytes) = cache.result_bytes {
            config.result_cache_bytes = bytes;
        }
    }

    if let Some(helper) = yaml.helper {
        if let Some(path) = helper.path {
            config.helper_path = Some(PathBuf::from(path));
        }
        if let Some(args) = helper.args {
            config.helper_args = args;
        }
        if let Some(ms) = helper.timeout_ms {
            config.helper_timeout = Duration::from_millis(ms);
        }
        if let Some(dir) = helper.scratch_dir {
            config.scratch_dir = Some(PathBuf::from(dir));
        }
    }

    if let Some(bytes) = yaml
        .classifier
        .and_then(|classifier| classifier.heuristic_size_threshold_bytes)
    {
        config.heuristic_size_threshold_bytes = bytes;
    }

    if let Some(voices) = yaml.voices {
        if let Some(path) = voices.manifest {
            config.voice_manifest = Some(PathBuf::from(path));
        }
        if let Some(dir) = voices.dir {
            config.voices_dir = Some(PathBuf::from(dir));
        }
        if let Some(dim) = voices.embedding_dim {
            config.embedding_dim = dim;
        }
        if let Some(preload) = voices.preload {
            config.preload_voices = preload;
        }
        if let Some(ms) = voices.check_interval_ms {
            config.manifest_check_interval = Duration::from_millis(ms);
        }
    }

    Ok(config)
}
