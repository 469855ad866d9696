//! Prioritized backend slots with failure tracking
//!
//! The manager keeps at most one backend loaded and active. Transient
//! failures demote it; after a cooldown it may serve a single probation
//! request, and on success it takes traffic back from lower-priority slots.

pub mod health;
pub mod manager;

pub use health::{BackendHealthRecord, HealthState, LATENCY_WINDOW};
pub use manager::{
    BackendCandidate, BackendLease, BackendStatus, FallbackManager, FallbackPolicy, SlotPhase,
};
