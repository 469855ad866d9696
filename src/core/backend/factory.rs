//! Backend selection
//!
//! Selection is split in two: [`BackendFactory::plan`] is a pure function of
//! the descriptor and the preference, and [`BackendFactory::create`] walks
//! the plan, loading one variant after another until one succeeds.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::native::{SessionLoader, default_session_loader};
use super::{BackendHandle, BackendOptions, BackendPreference, BackendVariant};
use crate::core::model::ModelDescriptor;
use crate::errors::{EngineError, EngineResult};

/// Why a variant was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionRationale {
    /// The configured preference is compatible with the model
    ForcedPreference,
    /// The variant's native format matches the classified format
    ExactMatch,
    /// Format was guessed from size; the lower-risk variant goes first
    Heuristic,
    /// The first heuristic choice failed to load and the alternate was used
    HeuristicFallback,
}

impl std::fmt::Display for SelectionRationale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionRationale::ForcedPreference => write!(f, "forced-preference"),
            SelectionRationale::ExactMatch => write!(f, "exact-match"),
            SelectionRationale::Heuristic => write!(f, "heuristic"),
            SelectionRationale::HeuristicFallback => write!(f, "heuristic-fallback"),
        }
    }
}

/// Ordered variants to attempt for one model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionPlan {
    pub attempts: Vec<BackendVariant>,
    pub rationale: SelectionRationale,
}

/// Constructs backends for classified models
#[derive(Clone)]
pub struct BackendFactory {
    options: BackendOptions,
    loader: Arc<dyn SessionLoader>,
}

impl BackendFactory {
    pub fn new(options: BackendOptions, loader: Arc<dyn SessionLoader>) -> Self {
        Self { options, loader }
    }

    /// Factory using the numeric runtime compiled into this build
    pub fn with_default_loader(options: BackendOptions) -> Self {
        Self::new(options, default_session_loader())
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Decide which variants to try, in order
    pub fn plan(
        descriptor: &ModelDescriptor,
        preferred: BackendPreference,
        allow_fallback: bool,
    ) -> SelectionPlan {
        let with_alternate = |first: BackendVariant| {
            let mut attempts = vec![first];
            let alternate = first.alternate();
            // Only heuristic descriptors are compatible with both variants
            if allow_fallback && alternate.is_compatible(descriptor) {
                attempts.push(alternate);
            }
            attempts
        };

        if let Some(variant) = preferred.variant() {
            if variant.is_compatible(descriptor) {
                return SelectionPlan {
                    attempts: with_alternate(variant),
                    rationale: SelectionRationale::ForcedPreference,
                };
            }
            warn!(
                model = %descriptor.path().display(),
                preferred = %variant,
                format = %descriptor.format(),
                "Preferred backend is incompatible with model format; auto-selecting"
            );
        }

        if descriptor.is_heuristic() {
            SelectionPlan {
                attempts: with_alternate(BackendVariant::NativeRuntime),
                rationale: SelectionRationale::Heuristic,
            }
        } else {
            SelectionPlan {
                attempts: vec![BackendVariant::for_format(descriptor.format())],
                rationale: SelectionRationale::ExactMatch,
            }
        }
    }

    /// Select and load exactly one backend for `descriptor`
    pub async fn create(
        &self,
        descriptor: &ModelDescriptor,
        preferred: BackendPreference,
        allow_fallback: bool,
    ) -> EngineResult<BackendHandle> {
        let plan = Self::plan(descriptor, preferred, allow_fallback);
        let mut last_error = None;

        for (attempt, variant) in plan.attempts.iter().enumerate() {
            let rationale = if attempt > 0 && plan.rationale == SelectionRationale::Heuristic {
                SelectionRationale::HeuristicFallback
            } else {
                plan.rationale
            };

            match BackendHandle::load(*variant, descriptor, &self.options, &self.loader).await {
                Ok(handle) => {
                    info!(
                        model = %descriptor.path().display(),
                        variant = %variant,
                        rationale = %rationale,
                        format = %descriptor.format(),
                        method = %descriptor.method(),
                        "Backend selected"
                    );
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(
                        model = %descriptor.path().display(),
                        variant = %variant,
                        error = %e,
                        "Backend load failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EngineError::InvalidConfiguration(format!(
                "no backend variant can run {}",
                descriptor.path().display()
            ))
        }))
    }
}

impl std::fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendFactory")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
