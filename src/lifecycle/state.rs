//! Backend lifecycle state machine
//!
//! [`BackendStatus::apply`] is the only place state changes. It performs no I/O;
//! side effects the caller has to carry out are returned as an [`Effect`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::health::{HealthCheckError, HealthSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LifecycleState {
    #[default]
    Stopped,
    Starting,
    Ready,
    Degraded,
    Failed,
    Stopping,
}

impl LifecycleState {
    /// Whether proxied requests may be forwarded
    pub fn is_serving(self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Degraded)
    }

    /// Top-level `status` reported by `/health`
    pub fn health_label(self) -> &'static str {
        match self {
            LifecycleState::Ready => "healthy",
            LifecycleState::Starting => "starting",
            LifecycleState::Degraded => "degraded",
            LifecycleState::Stopped | LifecycleState::Failed | LifecycleState::Stopping => {
                "unhealthy"
            }
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Starting => "Starting",
            LifecycleState::Ready => "Ready",
            LifecycleState::Degraded => "Degraded",
            LifecycleState::Failed => "Failed",
            LifecycleState::Stopping => "Stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    StartRequested,
    Spawned { pid: u32 },
    SpawnFailed(String),
    HealthPassed(HealthSnapshot),
    HealthFailed {
        snapshot: HealthSnapshot,
        error: HealthCheckError,
    },
    StartupTimedOut(Duration),
    ProcessExited(String),
    StopRequested,
    Terminated,
}

/// Work the caller must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    TerminateProcess,
}

/// Snapshot of the backend as seen by the lifecycle manager
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendStatus {
    pub state: LifecycleState,
    pub health: Option<HealthSnapshot>,
    pub pid: Option<u32>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Failed probes since the backend last passed one while serving
    pub consecutive_failures: u32,
    /// Failed probes while Starting; never fatal on their own
    pub startup_probe_failures: u32,
    pub ready_since: Option<DateTime<Utc>>,
}

impl BackendStatus {
    /// Apply one event. Events with no transition from the current state are ignored.
    pub fn apply(&mut self, event: LifecycleEvent, max_failures: u32) -> Effect {
        use LifecycleEvent as E;
        use LifecycleState as S;

        match (self.state, event) {
            (S::Stopped | S::Failed, E::StartRequested) => {
                *self = BackendStatus {
                    state: S::Starting,
                    ..BackendStatus::default()
                };
                Effect::None
            }
            (S::Starting, E::Spawned { pid }) => {
                self.pid = Some(pid);
                Effect::None
            }
            (S::Starting, E::SpawnFailed(reason)) => {
                self.state = S::Failed;
                self.pid = None;
                self.last_error = Some(reason);
                Effect::None
            }
            (S::Starting, E::HealthPassed(snapshot)) => {
                let now = Utc::now();
                self.state = S::Ready;
                self.health = Some(snapshot);
                self.last_check = Some(now);
                self.ready_since = Some(now);
                self.consecutive_failures = 0;
                Effect::None
            }
            // Counted apart from consecutive_failures: a slow model load is not a
            // serving failure. Only the startup deadline fails a Starting backend.
            (S::Starting, E::HealthFailed { snapshot, .. }) => {
                self.startup_probe_failures += 1;
                self.health = Some(snapshot);
                self.last_check = Some(Utc::now());
                Effect::None
            }
            (S::Starting, E::StartupTimedOut(timeout)) => {
                self.state = S::Failed;
                self.pid = None;
                self.last_error = Some(format!(
                    "Backend did not become ready within {}s",
                    timeout.as_secs_f64()
                ));
                self.mark_unhealthy("startup timeout");
                Effect::TerminateProcess
            }
            (S::Starting | S::Ready | S::Degraded, E::ProcessExited(reason)) => {
                self.state = S::Failed;
                self.pid = None;
                self.mark_unhealthy(&reason);
                self.last_error = Some(reason);
                Effect::TerminateProcess
            }
            (S::Ready | S::Degraded, E::HealthPassed(snapshot)) => {
                self.state = S::Ready;
                self.health = Some(snapshot);
                self.last_check = Some(Utc::now());
                self.consecutive_failures = 0;
                Effect::None
            }
            (S::Ready | S::Degraded, E::HealthFailed { snapshot, error }) => {
                self.consecutive_failures += 1;
                self.health = Some(snapshot);
                self.last_check = Some(Utc::now());

                if self.consecutive_failures >= max_failures {
                    self.state = S::Failed;
                    self.pid = None;
                    self.last_error = Some(format!(
                        "Backend failed {} consecutive health checks: {}",
                        self.consecutive_failures, error
                    ));
                    Effect::TerminateProcess
                } else {
                    self.state = S::Degraded;
                    self.last_error = Some(error.to_string());
                    Effect::None
                }
            }
            (S::Starting | S::Ready | S::Degraded | S::Failed, E::StopRequested) => {
                self.state = S::Stopping;
                Effect::TerminateProcess
            }
            (S::Stopping, E::Terminated) => {
                *self = BackendStatus::default();
                Effect::None
            }
            _ => Effect::None,
        }
    }

    fn mark_unhealthy(&mut self, detail: &str) {
        if let Some(health) = self.health.as_mut() {
            health.healthy = false;
            health.detail = detail.to_string();
        }
    }
}
