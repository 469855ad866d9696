//! `VOXCORE_*` environment variables

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::{BackendConfig, EngineConfig};
use crate::core::backend::BackendPreference;

/// Apply environment overrides to `config`
pub(super) fn load_from_env(
    mut config: EngineConfig,
) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    if let Some(preference) = env_string("VOXCORE_BACKEND") {
        config.backend_preference = preference.parse::<BackendPreference>()?;
    }
    if let Some(model) = env_string("VOXCORE_MODEL") {
        let model = PathBuf::from(model);
        let name = model
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string());
        config.backends.push(BackendConfig {
            name,
            model,
            preference: None,
            priority: Some(0),
        });
    }
    if let Some(dir) = env_string("VOXCORE_MODEL_DIR") {
        config.model_dir = Some(PathBuf::from(dir));
    }
    if let Some(pool_size) = env_parse("VOXCORE_POOL_SIZE")? {
        config.session_pool_size = pool_size;
    }
    if let Some(threads) = env_parse("VOXCORE_NUM_THREADS")? {
        config.num_threads = Some(threads);
    }
    if let Some(rate) = env_parse("VOXCORE_SAMPLE_RATE")? {
        config.model_sample_rate = rate;
    }

    if let Some(enabled) = env_parse("VOXCORE_ALLOW_FALLBACK")? {
        config.allow_fallback = enabled;
    }
    if let Some(threshold) = env_parse("VOXCORE_FAILURE_THRESHOLD")? {
        config.failure_threshold = threshold;
    }
    if let Some(window) = env_millis("VOXCORE_FAILURE_WINDOW_MS")? {
        config.failure_window = window;
    }
    if let Some(cooldown) = env_millis("VOXCORE_QUARANTINE_COOLDOWN_MS")? {
        config.quarantine_cooldown = cooldown;
    }

    if let Some(bytes) = env_parse("VOXCORE_VOICE_CACHE_BYTES")? {
        config.voice_cache_bytes = bytes;
    }
    if let Some(bytes) = env_parse("VOXCORE_RESULT_CACHE_BYTES")? {
        config.result_cache_bytes = bytes;
    }

    if let Some(path) = env_string("VOXCORE_HELPER_PATH") {
        config.helper_path = Some(PathBuf::from(path));
    }
    if let Some(args) = env_string("VOXCORE_HELPER_ARGS") {
        config.helper_args = args.split_whitespace().map(str::to_string).collect();
    }
    if let Some(timeout) = env_millis("VOXCORE_HELPER_TIMEOUT_MS")? {
        config.helper_timeout = timeout;
    }
    if let Some(dir) = env_string("VOXCORE_SCRATCH_DIR") {
        config.scratch_dir = Some(PathBuf::from(dir));
    }

    if let Some(bytes) = env_parse("VOXCORE_HEURISTIC_THRESHOLD_BYTES")? {
        config.heuristic_size_threshold_bytes = bytes;
    }

    if let Some(path) = env_string("VOXCORE_VOICE_MANIFEST") {
        config.voice_manifest = Some(PathBuf::from(path));
    }
    if let Some(dir) = env_string("VOXCORE_VOICES_DIR") {
        config.voices_dir = Some(PathBuf::from(dir));
    }
    if let Some(dim) = env_parse("VOXCORE_EMBEDDING_DIM")? {
        config.embedding_dim = dim;
    }
    if let Some(voices) = env_string("VOXCORE_PRELOAD_VOICES") {
        config.preload_voices = voices
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(interval) = env_millis("VOXCORE_MANIFEST_CHECK_INTERVAL_MS")? {
        config.manifest_check_interval = interval;
    }

    Ok(config)
}

/// Non-empty value of `key`
fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| format!("Invalid value for {key}: {value:?} ({e})"))
        })
        .transpose()
}

fn env_millis(key: &str) -> Result<Option<Duration>, String> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}
