//! Error taxonomy for the acoustic backend core.
//!
//! Every error carries owned context only (no `io::Error` or runtime handles)
//! so it can be cloned and fanned out to every waiter of a coalesced
//! computation.

use std::path::PathBuf;
use std::time::Duration;

use crate::core::backend::BackendVariant;
use crate::core::cache::Fingerprint;

/// Engine-level error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// The classifier could not determine the format of a model file
    #[error("Unrecognized model format for {}: {reason}", .path.display())]
    UnrecognizedFormat { path: PathBuf, reason: String },

    /// A backend failed to initialize
    #[error("Failed to load {variant} backend: {reason}")]
    Load {
        variant: BackendVariant,
        reason: String,
    },

    /// Voice file content does not match its manifest checksum
    #[error("Voice '{voice_id}' failed integrity check: expected {expected}, found {actual}")]
    Integrity {
        voice_id: String,
        expected: String,
        actual: String,
    },

    /// Voice is absent from the manifest or its file is missing
    #[error("Voice '{voice_id}' not found: {reason}")]
    VoiceNotFound { voice_id: String, reason: String },

    /// A single inference attempt failed
    #[error("{variant} inference failed: {reason}")]
    Inference {
        variant: BackendVariant,
        reason: String,
    },

    /// A single inference attempt exceeded its wall-clock budget
    #[error("{variant} inference timed out after {}ms", .elapsed.as_millis())]
    Timeout {
        variant: BackendVariant,
        elapsed: Duration,
    },

    /// Every configured backend is quarantined or disabled
    #[error("All backends unavailable ({unavailable} of {total} quarantined or disabled)")]
    AllBackendsUnavailable { unavailable: usize, total: usize },

    /// Malformed synthesis request (empty voice id, empty phonemes)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Filesystem or process I/O failure outside a specific backend attempt
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Stable error categories exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UnrecognizedFormat,
    LoadFailed,
    Integrity,
    VoiceNotFound,
    InferenceFailed,
    Timeout,
    AllBackendsUnavailable,
    InvalidRequest,
    Configuration,
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::UnrecognizedFormat => "unrecognized_format",
            ErrorCategory::LoadFailed => "load_failed",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::VoiceNotFound => "voice_not_found",
            ErrorCategory::InferenceFailed => "inference_failed",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::AllBackendsUnavailable => "all_backends_unavailable",
            ErrorCategory::InvalidRequest => "invalid_request",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Io => "io",
        };
        f.write_str(name)
    }
}

impl EngineError {
    /// Stable category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::UnrecognizedFormat { .. } => ErrorCategory::UnrecognizedFormat,
            EngineError::Load { .. } => ErrorCategory::LoadFailed,
            EngineError::Integrity { .. } => ErrorCategory::Integrity,
            EngineError::VoiceNotFound { .. } => ErrorCategory::VoiceNotFound,
            EngineError::Inference { .. } => ErrorCategory::InferenceFailed,
            EngineError::Timeout { .. } => ErrorCategory::Timeout,
            EngineError::AllBackendsUnavailable { .. } => ErrorCategory::AllBackendsUnavailable,
            EngineError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            EngineError::InvalidConfiguration(_) => ErrorCategory::Configuration,
            EngineError::Io(_) => ErrorCategory::Io,
        }
    }

    /// Per-attempt failures that count against a backend's health and may be
    /// retried once against the next active backend.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Inference { .. } | EngineError::Timeout { .. }
        )
    }

    /// The backend variant the error is attributed to, if any
    pub fn variant(&self) -> Option<BackendVariant> {
        match self {
            EngineError::Load { variant, .. }
            | EngineError::Inference { variant, .. }
            | EngineError::Timeout { variant, .. } => Some(*variant),
            _ => None,
        }
    }

    pub(crate) fn io(context: &str, err: std::io::Error) -> Self {
        EngineError::Io(format!("{context}: {err}"))
    }
}

/// A failed synthesis request, with enough context to reproduce it
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "Synthesis failed ({}) for voice '{voice_id}' [backend: {}, fingerprint: {}]: {error}",
    .error.category(),
    .backend.as_deref().unwrap_or("none"),
    .fingerprint.map(|fp| fp.to_string()).unwrap_or_else(|| "none".to_string())
)]
pub struct SynthesisFailure {
    #[source]
    pub error: EngineError,
    pub voice_id: String,
    pub fingerprint: Option<Fingerprint>,
    pub backend: Option<String>,
}

impl SynthesisFailure {
    /// Attribute `error` to a request. Without an attempted slot, the
    /// error's backend variant (if any) is reported instead.
    pub fn new(
        error: EngineError,
        voice_id: impl Into<String>,
        fingerprint: Option<Fingerprint>,
        backend: Option<String>,
    ) -> Self {
        let backend = backend.or_else(|| error.variant().map(|v| v.to_string()));
        Self {
            error,
            voice_id: voice_id.into(),
            fingerprint,
            backend,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let inference = EngineError::Inference {
            variant: BackendVariant::NativeRuntime,
            reason: "nan in output".to_string(),
        };
        let timeout = EngineError::Timeout {
            variant: BackendVariant::HelperProcess,
            elapsed: Duration::from_millis(5000),
        };
        let integrity = EngineError::Integrity {
            voice_id: "af_heart".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };

        assert!(inference.is_transient());
        assert!(timeout.is_transient());
        assert!(!integrity.is_transient());
        assert!(!EngineError::AllBackendsUnavailable { unavailable: 3, total: 3 }.is_transient());
    }

    #[test]
    fn test_category_display() {
        let err = EngineError::VoiceNotFound {
            voice_id: "bm_george".to_string(),
            reason: "not in manifest".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::VoiceNotFound);
        assert_eq!(err.category().to_string(), "voice_not_found");
    }

    #[test]
    fn test_timeout_message_includes_millis() {
        let err = EngineError::Timeout {
            variant: BackendVariant::HelperProcess,
            elapsed: Duration::from_millis(5000),
        };
        assert!(err.to_string().contains("5000ms"));
        assert_eq!(err.variant(), Some(BackendVariant::HelperProcess));
    }

    #[test]
    fn test_failure_context_in_message() {
        let failure = SynthesisFailure {
            error: EngineError::Inference {
                variant: BackendVariant::NativeRuntime,
                reason: "boom".to_string(),
            },
            voice_id: "af_heart".to_string(),
            fingerprint: None,
            backend: Some("kokoro-fp32".to_string()),
        };
        let msg = failure.to_string();
        assert!(msg.contains("af_heart"));
        assert!(msg.contains("kokoro-fp32"));
        assert!(msg.contains("inference_failed"));
    }
}
