//! Per-backend health statistics

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Number of recent successful attempts averaged into the rolling latency
pub const LATENCY_WINDOW: usize = 32;

/// Traffic eligibility of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Quarantined,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Quarantined => write!(f, "quarantined"),
        }
    }
}

/// Mutable statistics for one backend slot, owned by the fallback manager
#[derive(Debug, Clone)]
pub struct BackendHealthRecord {
    success_count: u64,
    failure_count: u64,
    latencies: VecDeque<Duration>,
    last_failure: Option<Instant>,
    recent_failures: VecDeque<Instant>,
    state: HealthState,
}

impl Default for BackendHealthRecord {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            last_failure: None,
            recent_failures: VecDeque::new(),
            state: HealthState::Healthy,
        }
    }
}

impl BackendHealthRecord {
    pub fn record_success(&mut self, latency: Duration) {
        self.success_count += 1;
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    /// Record a failed attempt and return the failure count inside `window`
    pub fn record_failure(&mut self, now: Instant, window: Duration) -> usize {
        self.failure_count += 1;
        self.last_failure = Some(now);
        self.recent_failures.push_back(now);
        self.prune(now, window);
        self.recent_failures.len()
    }

    /// Forget failures older than `window`
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.recent_failures.front() {
            if now.saturating_duration_since(*oldest) >= window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn clear_recent_failures(&mut self) {
        self.recent_failures.clear();
    }

    pub fn set_state(&mut self, state: HealthState) {
        self.state = state;
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    pub fn recent_failures(&self) -> usize {
        self.recent_failures.len()
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Mean latency of the last [`LATENCY_WINDOW`] successful attempts
    pub fn rolling_latency(&self) -> Option<Duration> {
        if self.latencies.is_empty() {
            return None;
        }
        let total: Duration = self.latencies.iter().sum();
        Some(total / self.latencies.len() as u32)
    }
}
