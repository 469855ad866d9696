//! Fallback manager
//!
//! Each configured model occupies a slot that moves through
//!
//! ```text
//! Candidate ──promote──▶ Active ──failures ≥ threshold──▶ Degraded
//!     ▲                                                     │
//!     └──── cooldown expired (probation) ◀── Quarantined ◀──┘
//! ```
//!
//! At most one slot is active. The slot lock is a plain mutex that is never
//! held across an await; backend loads and unloads happen outside it.
//! Promotions are serialized by a separate async mutex so that a burst of
//! requests arriving with no active backend loads one backend, not many.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::health::{BackendHealthRecord, HealthState};
use crate::core::backend::{
    BackendDescription, BackendFactory, BackendHandle, BackendPreference, BackendVariant,
    InferenceBackend,
};
use crate::core::model::ModelDescriptor;
use crate::errors::{EngineError, EngineResult};

/// One configured backend
#[derive(Debug, Clone)]
pub struct BackendCandidate {
    /// Unique slot name, used in logs, status and audio metadata
    pub name: String,
    pub descriptor: ModelDescriptor,
    pub preference: BackendPreference,
    /// Lower is preferred. Unset ranks after every explicit priority.
    pub priority: Option<u32>,
}

impl BackendCandidate {
    pub fn new(name: impl Into<String>, descriptor: ModelDescriptor) -> Self {
        Self {
            name: name.into(),
            descriptor,
            preference: BackendPreference::Auto,
            priority: None,
        }
    }

    pub fn with_preference(mut self, preference: BackendPreference) -> Self {
        self.preference = preference;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Demotion and quarantine thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Failures inside `failure_window` that demote the active backend
    pub failure_threshold: u32,
    #[serde(with = "duration_millis")]
    pub failure_window: Duration,
    /// Time from demotion until a backend may serve a probation request
    #[serde(with = "duration_millis")]
    pub quarantine_cooldown: Duration,
    /// Let the factory try the alternate variant when the first one fails to load
    pub allow_fallback: bool,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            quarantine_cooldown: Duration::from_secs(30),
            allow_fallback: true,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Externally visible slot phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPhase {
    Candidate,
    Active,
    Degraded,
    Quarantined,
    /// The model can never be served (unrecognized format)
    Disabled,
}

#[derive(Debug, Clone)]
enum SlotState {
    Candidate { probation: bool },
    Active { probation: bool },
    Degraded { since: Instant },
    Quarantined { until: Instant },
    Disabled { reason: String },
}

impl SlotState {
    fn phase(&self) -> SlotPhase {
        match self {
            SlotState::Candidate { .. } => SlotPhase::Candidate,
            SlotState::Active { .. } => SlotPhase::Active,
            SlotState::Degraded { .. } => SlotPhase::Degraded,
            SlotState::Quarantined { .. } => SlotPhase::Quarantined,
            SlotState::Disabled { .. } => SlotPhase::Disabled,
        }
    }

    fn is_unavailable(&self) -> bool {
        matches!(
            self,
            SlotState::Degraded { .. } | SlotState::Quarantined { .. } | SlotState::Disabled { .. }
        )
    }
}

struct Slot {
    index: usize,
    candidate: BackendCandidate,
    state: SlotState,
    health: BackendHealthRecord,
    handle: Option<Arc<BackendHandle>>,
    generation: u64,
}

impl Slot {
    /// Position in the configuration, ignoring measured latency
    fn rank(&self) -> (u32, usize) {
        (self.candidate.priority.unwrap_or(u32::MAX), self.index)
    }

    /// Full promotion order: configured priority, rolling latency, declaration order
    fn priority_key(&self) -> (u32, Duration, usize) {
        (
            self.candidate.priority.unwrap_or(u32::MAX),
            self.health.rolling_latency().unwrap_or(Duration::MAX),
            self.index,
        )
    }

    fn lease(&self) -> Option<BackendLease> {
        let probation = matches!(self.state, SlotState::Active { probation: true });
        self.handle.as_ref().map(|handle| BackendLease {
            slot: self.index,
            generation: self.generation,
            name: self.candidate.name.clone(),
            handle: handle.clone(),
            probation,
        })
    }

    fn quarantine(&mut self, until: Instant) {
        self.state = SlotState::Quarantined { until };
        self.health.set_state(HealthState::Quarantined);
    }
}

/// Right to run one request on the active backend
#[derive(Debug, Clone)]
pub struct BackendLease {
    slot: usize,
    generation: u64,
    name: String,
    handle: Arc<BackendHandle>,
    probation: bool,
}

impl BackendLease {
    pub fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variant(&self) -> BackendVariant {
        self.handle.variant()
    }

    /// True when this request decides whether the backend returns to service
    pub fn is_probation(&self) -> bool {
        self.probation
    }
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub model: String,
    pub phase: SlotPhase,
    pub health: HealthState,
    pub probation: bool,
    pub variant: Option<BackendVariant>,
    pub priority: Option<u32>,
    pub success_count: u64,
    pub failure_count: u64,
    pub recent_failures: usize,
    pub rolling_latency_ms: Option<f64>,
    pub quarantine_remaining_ms: Option<u64>,
    pub description: Option<BackendDescription>,
    pub disabled_reason: Option<String>,
}

enum Decision {
    Serve(BackendLease),
    Preempt { current: BackendLease, target: usize },
    Promote(usize),
    Unavailable(EngineError),
}

/// Prioritized backends with demotion, quarantine and probation
pub struct FallbackManager {
    factory: BackendFactory,
    policy: FallbackPolicy,
    slots: Mutex<Vec<Slot>>,
    promotion: tokio::sync::Mutex<()>,
}

impl FallbackManager {
    pub fn new(
        candidates: Vec<BackendCandidate>,
        policy: FallbackPolicy,
        factory: BackendFactory,
    ) -> EngineResult<Self> {
        if candidates.is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "at least one backend candidate is required".to_string(),
            ));
        }
        if policy.failure_threshold == 0 {
            return Err(EngineError::InvalidConfiguration(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        for (i, candidate) in candidates.iter().enumerate() {
            if candidates[..i].iter().any(|c| c.name == candidate.name) {
                return Err(EngineError::InvalidConfiguration(format!(
                    "duplicate backend name: {}",
                    candidate.name
                )));
            }
        }

        let slots = candidates
            .into_iter()
            .enumerate()
            .map(|(index, candidate)| Slot {
                index,
                candidate,
                state: SlotState::Candidate { probation: false },
                health: BackendHealthRecord::default(),
                handle: None,
                generation: 0,
            })
            .collect();

        Ok(Self {
            factory,
            policy,
            slots: Mutex::new(slots),
            promotion: tokio::sync::Mutex::new(()),
        })
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Load the best candidate ahead of the first request
    pub async fn warm_up(&self) -> EngineResult<String> {
        self.acquire().await.map(|lease| lease.name)
    }

    /// Lease the active backend, promoting a candidate if none is active
    pub async fn acquire(&self) -> EngineResult<BackendLease> {
        match self.decide() {
            Decision::Serve(lease) => return Ok(lease),
            Decision::Unavailable(err) => return Err(err),
            Decision::Preempt { current, .. } => {
                // One caller promotes; everyone else keeps using the current backend
                let Ok(_guard) = self.promotion.try_lock() else {
                    return Ok(current);
                };
                return self.promote_until_served().await;
            }
            Decision::Promote(_) => {}
        }

        let _guard = self.promotion.lock().await;
        self.promote_until_served().await
    }

    /// Caller holds the promotion lock
    async fn promote_until_served(&self) -> EngineResult<BackendLease> {
        let attempts = self.len() + 1;
        for _ in 0..attempts {
            let target = match self.decide() {
                Decision::Serve(lease) => return Ok(lease),
                Decision::Unavailable(err) => return Err(err),
                Decision::Preempt { target, .. } | Decision::Promote(target) => target,
            };
            self.promote(target).await;
        }
        Err(self.unavailable_error(&self.slots.lock()))
    }

    fn decide(&self) -> Decision {
        let mut slots = self.slots.lock();
        self.refresh(&mut slots, Instant::now());

        let active = slots
            .iter()
            .find(|slot| matches!(slot.state, SlotState::Active { .. }))
            .and_then(|slot| slot.lease().map(|lease| (slot.rank(), lease)));
        let best_candidate = slots
            .iter()
            .filter(|slot| matches!(slot.state, SlotState::Candidate { .. }))
            .min_by_key(|slot| slot.priority_key());

        match (active, best_candidate) {
            (Some((active_rank, lease)), Some(candidate))
                if matches!(candidate.state, SlotState::Candidate { probation: true })
                    && candidate.rank() < active_rank =>
            {
                Decision::Preempt {
                    current: lease,
                    target: candidate.index,
                }
            }
            (Some((_, lease)), _) => Decision::Serve(lease),
            (None, Some(candidate)) => Decision::Promote(candidate.index),
            (None, None) => Decision::Unavailable(self.unavailable_error(&slots)),
        }
    }

    fn unavailable_error(&self, slots: &[Slot]) -> EngineError {
        EngineError::AllBackendsUnavailable {
            unavailable: slots.iter().filter(|s| s.state.is_unavailable()).count(),
            total: slots.len(),
        }
    }

    /// Apply time-based transitions
    fn refresh(&self, slots: &mut [Slot], now: Instant) {
        for slot in slots.iter_mut() {
            slot.health.prune(now, self.policy.failure_window);

            if let SlotState::Degraded { since } = slot.state {
                let until = since + self.policy.quarantine_cooldown;
                slot.quarantine(until);
                info!(
                    backend = %slot.candidate.name,
                    cooldown_ms = self.policy.quarantine_cooldown.as_millis() as u64,
                    "Backend quarantined"
                );
            }

            if let SlotState::Quarantined { until } = slot.state {
                if now >= until {
                    slot.state = SlotState::Candidate { probation: true };
                    slot.health.set_state(HealthState::Healthy);
                    slot.health.clear_recent_failures();
                    info!(
                        backend = %slot.candidate.name,
                        "Quarantine expired; backend eligible for probation"
                    );
                }
            }
        }
    }

    /// Load the target slot's backend and make it the active one
    async fn promote(&self, target: usize) {
        let (candidate, probation) = {
            let slots = self.slots.lock();
            match &slots[target].state {
                SlotState::Candidate { probation } => (slots[target].candidate.clone(), *probation),
                _ => return,
            }
        };

        let result = self
            .factory
            .create(
                &candidate.descriptor,
                candidate.preference,
                self.policy.allow_fallback,
            )
            .await;
        let now = Instant::now();

        let mut retired = None;
        {
            let mut slots = self.slots.lock();
            match result {
                Ok(handle) => {
                    let previous = slots
                        .iter_mut()
                        .find(|slot| matches!(slot.state, SlotState::Active { .. }));
                    if let Some(previous) = previous {
                        info!(
                            backend = %previous.candidate.name,
                            replaced_by = %candidate.name,
                            "Backend preempted by higher priority backend"
                        );
                        previous.state = SlotState::Candidate { probation: false };
                        retired = previous.handle.take();
                    }

                    let slot = &mut slots[target];
                    slot.generation += 1;
                    slot.handle = Some(Arc::new(handle));
                    slot.state = SlotState::Active { probation };
                    slot.health.set_state(HealthState::Healthy);
                    info!(
                        backend = %slot.candidate.name,
                        model = %slot.candidate.descriptor.path().display(),
                        probation,
                        generation = slot.generation,
                        "Backend promoted to active"
                    );
                }
                Err(e @ EngineError::UnrecognizedFormat { .. }) => {
                    let slot = &mut slots[target];
                    error!(
                        backend = %slot.candidate.name,
                        error = %e,
                        "Backend disabled: model format cannot be served"
                    );
                    slot.state = SlotState::Disabled {
                        reason: e.to_string(),
                    };
                    slot.health.set_state(HealthState::Quarantined);
                }
                Err(e) => {
                    let cooldown = self.policy.quarantine_cooldown;
                    let slot = &mut slots[target];
                    slot.health.record_failure(now, self.policy.failure_window);
                    slot.quarantine(now + cooldown);
                    warn!(
                        backend = %slot.candidate.name,
                        error = %e,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Backend failed to load; quarantined"
                    );
                }
            }
        }

        if let Some(handle) = retired {
            handle.unload().await;
        }
    }

    /// Record a successful attempt
    pub fn report_success(&self, lease: &BackendLease, latency: Duration) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[lease.slot];
        slot.health.record_success(latency);

        if slot.generation == lease.generation
            && matches!(slot.state, SlotState::Active { probation: true })
        {
            slot.state = SlotState::Active { probation: false };
            info!(
                backend = %slot.candidate.name,
                "Backend passed probation; restored to full traffic"
            );
        }
    }

    /// Record a failed attempt. Returns true if the backend was demoted.
    ///
    /// Only transient errors count against a backend. Reports from a lease
    /// issued before the slot's latest promotion update statistics only.
    pub async fn report_failure(&self, lease: &BackendLease, error: &EngineError) -> bool {
        if !error.is_transient() {
            return false;
        }

        let now = Instant::now();
        let retired = {
            let mut slots = self.slots.lock();
            let slot = &mut slots[lease.slot];
            let recent = slot.health.record_failure(now, self.policy.failure_window);

            let current = slot.generation == lease.generation
                && matches!(slot.state, SlotState::Active { .. });
            if !current {
                return false;
            }

            let probation = matches!(slot.state, SlotState::Active { probation: true });
            if !probation && recent < self.policy.failure_threshold as usize {
                warn!(
                    backend = %slot.candidate.name,
                    error = %error,
                    recent_failures = recent,
                    threshold = self.policy.failure_threshold,
                    "Backend attempt failed"
                );
                return false;
            }

            slot.state = SlotState::Degraded { since: now };
            slot.health.set_state(HealthState::Degraded);
            warn!(
                backend = %slot.candidate.name,
                error = %error,
                recent_failures = recent,
                probation,
                "Backend degraded; promoting next candidate"
            );
            slot.handle.take()
        };

        if let Some(handle) = retired {
            handle.unload().await;
        }
        true
    }

    /// Quarantine a slot immediately, unloading its backend
    pub async fn force_quarantine(&self, name: &str) -> EngineResult<()> {
        let retired = {
            let mut slots = self.slots.lock();
            let slot = find_slot(&mut slots, name)?;
            slot.quarantine(Instant::now() + self.policy.quarantine_cooldown);
            warn!(backend = %name, "Backend force-quarantined");
            slot.handle.take()
        };
        if let Some(handle) = retired {
            handle.unload().await;
        }
        Ok(())
    }

    /// Return a degraded, quarantined or disabled slot to the candidate pool
    /// on probation
    pub fn release(&self, name: &str) -> EngineResult<()> {
        let mut slots = self.slots.lock();
        let slot = find_slot(&mut slots, name)?;
        if slot.state.is_unavailable() {
            slot.state = SlotState::Candidate { probation: true };
            slot.health.set_state(HealthState::Healthy);
            slot.health.clear_recent_failures();
            info!(backend = %name, "Backend released for probation");
        }
        Ok(())
    }

    /// Snapshot of every slot, in declaration order
    pub fn status(&self) -> Vec<BackendStatus> {
        let now = Instant::now();
        let slots = self.slots.lock();
        slots
            .iter()
            .map(|slot| {
                let (probation, quarantine_remaining_ms, disabled_reason) = match &slot.state {
                    SlotState::Candidate { probation } | SlotState::Active { probation } => {
                        (*probation, None, None)
                    }
                    SlotState::Quarantined { until } => (
                        false,
                        Some(until.saturating_duration_since(now).as_millis() as u64),
                        None,
                    ),
                    SlotState::Degraded { .. } => (false, None, None),
                    SlotState::Disabled { reason } => (false, None, Some(reason.clone())),
                };
                BackendStatus {
                    name: slot.candidate.name.clone(),
                    model: slot.candidate.descriptor.path().display().to_string(),
                    phase: slot.state.phase(),
                    health: slot.health.state(),
                    probation,
                    variant: slot.handle.as_ref().map(|handle| handle.variant()),
                    priority: slot.candidate.priority,
                    success_count: slot.health.success_count(),
                    failure_count: slot.health.failure_count(),
                    recent_failures: slot.health.recent_failures(),
                    rolling_latency_ms: slot
                        .health
                        .rolling_latency()
                        .map(|latency| latency.as_secs_f64() * 1000.0),
                    quarantine_remaining_ms,
                    description: slot.handle.as_ref().map(|handle| handle.describe()),
                    disabled_reason,
                }
            })
            .collect()
    }

    /// Name of the active slot, if any
    pub fn active(&self) -> Option<String> {
        self.slots
            .lock()
            .iter()
            .find(|slot| matches!(slot.state, SlotState::Active { .. }))
            .map(|slot| slot.candidate.name.clone())
    }

    /// Unload every backend
    pub async fn shutdown(&self) {
        let _guard = self.promotion.lock().await;
        let handles: Vec<Arc<BackendHandle>> = {
            let mut slots = self.slots.lock();
            slots
                .iter_mut()
                .filter_map(|slot| {
                    if matches!(slot.state, SlotState::Active { .. }) {
                        slot.state = SlotState::Candidate { probation: false };
                    }
                    slot.handle.take()
                })
                .collect()
        };

        let count = handles.len();
        for handle in handles {
            handle.unload().await;
        }
        info!(unloaded = count, "Fallback manager shut down");
    }
}

fn find_slot<'a>(slots: &'a mut [Slot], name: &str) -> EngineResult<&'a mut Slot> {
    slots
        .iter_mut()
        .find(|slot| slot.candidate.name == name)
        .ok_or_else(|| EngineError::InvalidRequest(format!("unknown backend slot: {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::BackendOptions;
    use crate::core::backend::native::{AcousticSession, SessionLoader};
    use crate::core::model::{ClassifierConfig, classify};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SilentSession;

    impl AcousticSession for SilentSession {
        fn run(&mut self, tokens: &[i64], _style: &[f32], _speed: f32) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.0; tokens.len()])
        }
    }

    #[derive(Default)]
    struct SelectiveLoader {
        broken: parking_lot::Mutex<HashSet<String>>,
        loads: AtomicUsize,
    }

    impl SessionLoader for SelectiveLoader {
        fn load(
            &self,
            descriptor: &ModelDescriptor,
            _options: &BackendOptions,
        ) -> anyhow::Result<Box<dyn AcousticSession>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.broken.lock().contains(&descriptor.file_name()) {
                anyhow::bail!("weights unreadable");
            }
            Ok(Box::new(SilentSession))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        loader: Arc<SelectiveLoader>,
        manager: FallbackManager,
    }

    fn fixture(names: &[&str], policy: FallbackPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let candidates = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let path = dir.path().join(format!("{name}.onnx"));
                std::fs::write(&path, [0x08, 0x07, 0x12, 0x04, b't', b'e', b's', b't']).unwrap();
                let descriptor = classify(&path, &ClassifierConfig::default()).unwrap();
                BackendCandidate::new(*name, descriptor).with_priority(i as u32)
            })
            .collect();
        let loader = Arc::new(SelectiveLoader::default());
        let factory = BackendFactory::new(BackendOptions::default(), loader.clone());
        let manager = FallbackManager::new(candidates, policy, factory).unwrap();
        Fixture {
            _dir: dir,
            loader,
            manager,
        }
    }

    fn policy() -> FallbackPolicy {
        FallbackPolicy {
            failure_threshold: 2,
            failure_window: Duration::from_secs(10),
            quarantine_cooldown: Duration::from_secs(5),
            allow_fallback: true,
        }
    }

    fn transient() -> EngineError {
        EngineError::Inference {
            variant: BackendVariant::NativeRuntime,
            reason: "session crashed".to_string(),
        }
    }

    fn phase(manager: &FallbackManager, name: &str) -> SlotPhase {
        manager
            .status()
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.phase)
            .unwrap()
    }

    #[test]
    fn test_rejects_bad_candidate_lists() {
        let factory = BackendFactory::with_default_loader(BackendOptions::default());
        assert!(FallbackManager::new(Vec::new(), policy(), factory).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.onnx");
        std::fs::write(&path, [0x08, 0x07, 0x12, 0x04]).unwrap();
        let descriptor = classify(&path, &ClassifierConfig::default()).unwrap();
        let dupes = vec![
            BackendCandidate::new("same", descriptor.clone()),
            BackendCandidate::new("same", descriptor),
        ];
        let factory = BackendFactory::with_default_loader(BackendOptions::default());
        assert!(matches!(
            FallbackManager::new(dupes, policy(), factory),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotes_by_priority() {
        let f = fixture(&["primary", "secondary"], policy());
        let lease = f.manager.acquire().await.unwrap();
        assert_eq!(lease.name(), "primary");
        assert!(!lease.is_probation());
        assert_eq!(phase(&f.manager, "primary"), SlotPhase::Active);
        assert_eq!(phase(&f.manager, "secondary"), SlotPhase::Candidate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_skips_to_next_candidate() {
        let f = fixture(&["primary", "secondary"], policy());
        f.loader.broken.lock().insert("primary.onnx".to_string());

        let lease = f.manager.acquire().await.unwrap();
        assert_eq!(lease.name(), "secondary");
        assert_eq!(phase(&f.manager, "primary"), SlotPhase::Quarantined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_failures_demote_active_backend() {
        let f = fixture(&["primary", "secondary"], policy());
        let lease = f.manager.acquire().await.unwrap();

        assert!(!f.manager.report_failure(&lease, &transient()).await);
        assert_eq!(f.manager.active().as_deref(), Some("primary"));
        assert!(f.manager.report_failure(&lease, &transient()).await);
        assert_eq!(f.manager.active(), None);

        let next = f.manager.acquire().await.unwrap();
        assert_eq!(next.name(), "secondary");
        assert_eq!(phase(&f.manager, "primary"), SlotPhase::Quarantined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_accumulate() {
        let f = fixture(&["primary", "secondary"], policy());
        let lease = f.manager.acquire().await.unwrap();

        assert!(!f.manager.report_failure(&lease, &transient()).await);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!f.manager.report_failure(&lease, &transient()).await);
        assert_eq!(f.manager.active().as_deref(), Some("primary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_errors_are_not_counted() {
        let f = fixture(&["primary"], policy());
        let lease = f.manager.acquire().await.unwrap();
        let not_found = EngineError::VoiceNotFound {
            voice_id: "nobody".to_string(),
            reason: "not in manifest".to_string(),
        };
        for _ in 0..5 {
            assert!(!f.manager.report_failure(&lease, &not_found).await);
        }
        assert_eq!(f.manager.active().as_deref(), Some("primary"));
        assert_eq!(f.manager.status()[0].failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_goes_through_probation_and_preempts() {
        let f = fixture(&["primary", "secondary"], policy());
        let first = f.manager.acquire().await.unwrap();
        f.manager.report_failure(&first, &transient()).await;
        f.manager.report_failure(&first, &transient()).await;
        assert_eq!(f.manager.acquire().await.unwrap().name(), "secondary");

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(f.manager.acquire().await.unwrap().name(), "secondary");

        tokio::time::advance(Duration::from_secs(2)).await;
        let trial = f.manager.acquire().await.unwrap();
        assert_eq!(trial.name(), "primary");
        assert!(trial.is_probation());
        assert_eq!(phase(&f.manager, "secondary"), SlotPhase::Candidate);

        f.manager.report_success(&trial, Duration::from_millis(20));
        let lease = f.manager.acquire().await.unwrap();
        assert_eq!(lease.name(), "primary");
        assert!(!lease.is_probation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probation_failure_requarantines_immediately() {
        let f = fixture(&["primary", "secondary"], policy());
        let first = f.manager.acquire().await.unwrap();
        f.manager.report_failure(&first, &transient()).await;
        f.manager.report_failure(&first, &transient()).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        let trial = f.manager.acquire().await.unwrap();
        assert!(trial.is_probation());

        assert!(f.manager.report_failure(&trial, &transient()).await);
        assert_eq!(f.manager.acquire().await.unwrap().name(), "secondary");
        assert_eq!(phase(&f.manager, "primary"), SlotPhase::Quarantined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lease_does_not_demote_new_generation() {
        let f = fixture(&["primary", "secondary"], policy());
        let stale = f.manager.acquire().await.unwrap();
        f.manager.report_failure(&stale, &transient()).await;
        f.manager.report_failure(&stale, &transient()).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        let trial = f.manager.acquire().await.unwrap();
        assert_eq!(trial.name(), "primary");

        assert!(!f.manager.report_failure(&stale, &transient()).await);
        assert_eq!(f.manager.active().as_deref(), Some("primary"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_backends_unavailable() {
        let f = fixture(&["primary", "secondary"], policy());
        f.loader.broken.lock().insert("primary.onnx".to_string());
        f.loader.broken.lock().insert("secondary.onnx".to_string());

        let err = f.manager.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::AllBackendsUnavailable {
                unavailable: 2,
                total: 2
            }
        ));

        f.loader.broken.lock().clear();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(f.manager.acquire().await.unwrap().name(), "primary");
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_slot_force_quarantined_fails_fast() {
        let f = fixture(&["primary", "secondary", "tertiary"], policy());
        f.manager.warm_up().await.unwrap();
        let loads = f.loader.loads.load(Ordering::SeqCst);

        for name in ["primary", "secondary", "tertiary"] {
            f.manager.force_quarantine(name).await.unwrap();
        }
        assert_eq!(f.manager.active(), None);
        assert!(
            f.manager
                .status()
                .iter()
                .all(|s| s.phase == SlotPhase::Quarantined && s.variant.is_none())
        );

        let err = f.manager.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::AllBackendsUnavailable {
                unavailable: 3,
                total: 3
            }
        ));
        assert_eq!(f.loader.loads.load(Ordering::SeqCst), loads);

        // Still inside the cooldown
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(f.manager.acquire().await.is_err());
        assert_eq!(f.loader.loads.load(Ordering::SeqCst), loads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_quarantine_and_release() {
        let f = fixture(&["primary", "secondary"], policy());
        f.manager.acquire().await.unwrap();

        f.manager.force_quarantine("primary").await.unwrap();
        let status = &f.manager.status()[0];
        assert_eq!(status.phase, SlotPhase::Quarantined);
        assert_eq!(status.quarantine_remaining_ms, Some(5000));
        assert_eq!(f.manager.acquire().await.unwrap().name(), "secondary");

        f.manager.release("primary").unwrap();
        let trial = f.manager.acquire().await.unwrap();
        assert_eq!(trial.name(), "primary");
        assert!(trial.is_probation());

        assert!(f.manager.force_quarantine("missing").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unloads_active_backend() {
        let f = fixture(&["primary"], policy());
        f.manager.acquire().await.unwrap();
        f.manager.shutdown().await;

        assert_eq!(f.manager.active(), None);
        assert_eq!(f.manager.status()[0].variant, None);
    }
}
