//! Background task that polls the backend and feeds the state machine

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::state::{LifecycleEvent, LifecycleState};
use super::BackendLifecycleManager;
use crate::backend::Backend;
use crate::health::HealthSnapshot;

/// Running monitor task and the token that stops it
#[derive(Debug)]
pub(crate) struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn spawn(manager: Arc<BackendLifecycleManager>) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(manager, cancel.clone()));
        MonitorHandle { cancel, task }
    }

    /// Cancel the task and wait for it to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run(manager: Arc<BackendLifecycleManager>, cancel: CancellationToken) {
    let settings = manager.settings().clone();
    let startup_deadline = Instant::now() + settings.startup_timeout;

    let mut ticker = interval(settings.health_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        interval_ms = settings.health_check_interval.as_millis() as u64,
        "Health monitor started"
    );

    loop {
        let starting = manager.current_state().state == LifecycleState::Starting;

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until(startup_deadline), if starting => {
                LifecycleEvent::StartupTimedOut(settings.startup_timeout)
            }
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = observe(manager.backend()) => event,
                }
            }
        };

        if !manager.handle_event(event).await {
            break;
        }
    }

    debug!("Health monitor stopped");
}

/// One monitoring round: liveness first, then the bounded readiness probe
async fn observe(backend: &Arc<dyn Backend>) -> LifecycleEvent {
    if let Some(reason) = backend.exit_reason().await {
        return LifecycleEvent::ProcessExited(reason);
    }

    match backend.health_check().await {
        Ok(snapshot) => LifecycleEvent::HealthPassed(snapshot),
        Err(error) => LifecycleEvent::HealthFailed {
            snapshot: HealthSnapshot::unhealthy(backend.base_url(), error.to_string()),
            error,
        },
    }
}
