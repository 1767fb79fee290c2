//! Backend lifecycle management
//!
//! [`BackendLifecycleManager`] owns the backend's [`BackendStatus`]. Every change
//! goes through one transition function under the watch channel's write lock;
//! request handlers and `/health` only read cloned snapshots.

mod monitor;
pub mod state;

pub use state::{BackendStatus, Effect, LifecycleEvent, LifecycleState};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::health::HealthCheckError;
use crate::supervisor::SupervisorError;
use monitor::MonitorHandle;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    SpawnFailed(#[from] SupervisorError),
}

/// Result of waiting for the backend to leave Starting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready,
    TimedOut,
    Failed(String),
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub startup_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_consecutive_failures: u32,
    /// Grace period when the manager itself terminates a failed backend
    pub termination_grace: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &Config) -> Self {
        LifecycleSettings {
            startup_timeout: config.backend.startup_timeout,
            health_check_interval: config.backend.health_check_interval,
            max_consecutive_failures: config.backend.max_consecutive_failures,
            termination_grace: config.proxy.shutdown_grace,
        }
    }
}

pub struct BackendLifecycleManager {
    backend: Arc<dyn Backend>,
    settings: LifecycleSettings,
    status: watch::Sender<BackendStatus>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl BackendLifecycleManager {
    pub fn new(backend: Arc<dyn Backend>, settings: LifecycleSettings) -> Self {
        let (status, _) = watch::channel(BackendStatus::default());
        BackendLifecycleManager {
            backend,
            settings,
            status,
            monitor: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Consistent snapshot of the current status
    pub fn current_state(&self) -> BackendStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BackendStatus> {
        self.status.subscribe()
    }

    /// Spawn the backend and begin monitoring it.
    ///
    /// A no-op while the backend is already Starting, Ready or Degraded.
    pub async fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        let mut monitor = self.monitor.lock().await;

        let state = self.status.borrow().state;
        if !matches!(state, LifecycleState::Stopped | LifecycleState::Failed) {
            debug!(state = %state, "Backend already started");
            return Ok(());
        }

        if let Some(previous) = monitor.take() {
            previous.shutdown().await;
        }

        self.transition(LifecycleEvent::StartRequested);
        info!(
            backend = self.backend.name(),
            url = self.backend.base_url(),
            "Starting backend"
        );

        match self.backend.start().await {
            Ok(pid) => {
                info!(pid, "{} process spawned", self.backend.name());
                self.transition(LifecycleEvent::Spawned { pid });
            }
            Err(e) => {
                error!("Failed to start {}: {}", self.backend.name(), e);
                self.transition(LifecycleEvent::SpawnFailed(e.to_string()));
                return Err(e.into());
            }
        }

        *monitor = Some(MonitorHandle::spawn(Arc::clone(self)));
        Ok(())
    }

    /// Wait until the backend leaves Starting, or `timeout` elapses
    pub async fn await_ready(&self, timeout: Duration) -> ReadyOutcome {
        let mut rx = self.status.subscribe();
        let waited =
            tokio::time::timeout(timeout, rx.wait_for(|s| s.state != LifecycleState::Starting))
                .await;

        match waited {
            Err(_) => ReadyOutcome::TimedOut,
            Ok(Err(_)) => ReadyOutcome::ShuttingDown,
            Ok(Ok(status)) => match status.state {
                LifecycleState::Ready | LifecycleState::Degraded => ReadyOutcome::Ready,
                LifecycleState::Failed => ReadyOutcome::Failed(
                    status
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "backend failed".to_string()),
                ),
                LifecycleState::Stopping | LifecycleState::Stopped => ReadyOutcome::ShuttingDown,
                LifecycleState::Starting => ReadyOutcome::TimedOut,
            },
        }
    }

    /// Stop monitoring, terminate the backend and return to Stopped
    pub async fn stop(&self, grace: Duration) {
        let mut monitor = self.monitor.lock().await;
        if let Some(handle) = monitor.take() {
            handle.shutdown().await;
        }

        if self.status.borrow().state == LifecycleState::Stopped {
            return;
        }

        self.transition(LifecycleEvent::StopRequested);
        info!("Stopping {} backend", self.backend.name());

        if let Err(e) = self.backend.stop(grace).await {
            error!("Failed to stop {}: {}", self.backend.name(), e);
        }
        self.transition(LifecycleEvent::Terminated);
    }

    fn transition(&self, event: LifecycleEvent) -> Effect {
        let max_failures = self.settings.max_consecutive_failures;
        let mut effect = Effect::None;

        self.status.send_modify(|status| {
            let from = status.state;
            effect = status.apply(event, max_failures);
            if status.state != from {
                info!(from = %from, to = %status.state, "Backend state changed");
            }
        });
        effect
    }

    /// Apply a monitor observation. Returns false once the backend has failed.
    pub(crate) async fn handle_event(&self, event: LifecycleEvent) -> bool {
        self.log_event(&event);

        if self.transition(event) == Effect::TerminateProcess {
            if let Err(e) = self.backend.stop(self.settings.termination_grace).await {
                error!("Failed to terminate {}: {}", self.backend.name(), e);
            }
        }

        let status = self.status.borrow();
        if status.state == LifecycleState::Failed {
            error!(
                error = status.last_error.as_deref().unwrap_or("unknown"),
                "{} backend failed", self.backend.name()
            );
            return false;
        }
        true
    }

    fn log_event(&self, event: &LifecycleEvent) {
        let state = self.status.borrow().state;
        match event {
            LifecycleEvent::HealthPassed(snapshot) => {
                debug!(detail = %snapshot.detail, "Health check passed");
            }
            LifecycleEvent::HealthFailed { error, .. } => match (state, error) {
                (LifecycleState::Starting, _) => {
                    debug!("Backend not ready yet: {}", error);
                }
                (_, HealthCheckError::ConnectionRefused(_)) => {
                    warn!("Backend refused connection, process may have crashed: {}", error);
                }
                _ => warn!("Health check failed: {}", error),
            },
            LifecycleEvent::ProcessExited(reason) => {
                error!(state = %state, "Backend process exited: {}", reason);
            }
            LifecycleEvent::StartupTimedOut(timeout) => {
                error!("Backend not ready after {:?}, giving up", timeout);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthSnapshot;
    use crate::testing::StubBackend;
    use tokio::time::Instant;

    fn settings(startup_timeout: Duration, interval: Duration) -> LifecycleSettings {
        LifecycleSettings {
            startup_timeout,
            health_check_interval: interval,
            max_consecutive_failures: 3,
            termination_grace: Duration::from_secs(1),
        }
    }

    fn manager(stub: &Arc<StubBackend>, settings: LifecycleSettings) -> Arc<BackendLifecycleManager> {
        Arc::new(BackendLifecycleManager::new(stub.clone(), settings))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_backend_comes_up() {
        let stub = Arc::new(StubBackend::new().healthy_after(Duration::from_secs(2)));
        let manager = manager(&stub, settings(Duration::from_secs(5), Duration::from_secs(1)));

        let started = Instant::now();
        manager.start().await.unwrap();
        assert_eq!(manager.current_state().state, LifecycleState::Starting);

        let outcome = manager.await_ready(Duration::from_secs(10)).await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, ReadyOutcome::Ready);
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed <= Duration::from_secs(3), "{elapsed:?}");

        let status = manager.current_state();
        assert_eq!(status.state, LifecycleState::Ready);
        assert_eq!(status.pid, Some(StubBackend::PID));
        assert_eq!(status.startup_probe_failures, 2);
        assert!(status.health.unwrap().healthy);

        manager.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_healthy_fails_at_startup_deadline() {
        let stub = Arc::new(StubBackend::new().never_healthy());
        let manager = manager(&stub, settings(Duration::from_secs(5), Duration::from_secs(1)));

        manager.start().await.unwrap();
        let outcome = manager.await_ready(Duration::from_secs(60)).await;

        match outcome {
            ReadyOutcome::Failed(reason) => assert!(reason.contains("within 5s"), "{reason}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let status = manager.current_state();
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(status.pid, None);
        assert_eq!(stub.stop_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_then_failed_terminates_once() {
        let stub = Arc::new(StubBackend::new().script(vec![
            Ok(()),
            Err(HealthCheckError::Timeout(Duration::from_secs(5))),
            Err(HealthCheckError::Timeout(Duration::from_secs(5))),
            Err(HealthCheckError::Timeout(Duration::from_secs(5))),
        ]));
        let manager = manager(&stub, settings(Duration::from_secs(5), Duration::from_secs(1)));

        manager.start().await.unwrap();
        assert_eq!(manager.await_ready(Duration::from_secs(5)).await, ReadyOutcome::Ready);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let status = manager.current_state();
        assert_eq!(status.state, LifecycleState::Degraded);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(stub.stop_calls(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = manager.current_state();
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.pid, None);
        assert_eq!(stub.stop_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_while_ready() {
        let stub = Arc::new(StubBackend::new());
        let manager = manager(&stub, settings(Duration::from_secs(5), Duration::from_secs(1)));

        manager.start().await.unwrap();
        assert_eq!(manager.await_ready(Duration::from_secs(5)).await, ReadyOutcome::Ready);

        stub.crash();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let status = manager.current_state();
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(status.pid, None);
        assert_eq!(status.last_error.as_deref(), Some(StubBackend::EXIT_REASON));
        assert_eq!(status.health.unwrap().detail, StubBackend::EXIT_REASON);
        assert_eq!(stub.stop_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_startup_releases_waiters() {
        let stub = Arc::new(StubBackend::new().never_healthy());
        let manager = manager(&stub, settings(Duration::from_secs(300), Duration::from_secs(1)));
        manager.start().await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.await_ready(Duration::from_secs(600)).await })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        manager.stop(Duration::from_secs(1)).await;

        assert_eq!(waiter.await.unwrap(), ReadyOutcome::ShuttingDown);
        assert_eq!(manager.current_state().state, LifecycleState::Stopped);
        assert_eq!(stub.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let stub = Arc::new(StubBackend::new().failing_spawn("python3: not found"));
        let manager = manager(&stub, settings(Duration::from_secs(5), Duration::from_secs(1)));

        let err = manager.start().await.unwrap_err();
        assert!(err.to_string().contains("python3: not found"));

        let status = manager.current_state();
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(
            manager.await_ready(Duration::from_secs(1)).await,
            ReadyOutcome::Failed(status.last_error.unwrap())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let stub = Arc::new(StubBackend::new());
        let manager = manager(&stub, settings(Duration::from_secs(5), Duration::from_secs(1)));

        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(manager.await_ready(Duration::from_secs(5)).await, ReadyOutcome::Ready);
        manager.start().await.unwrap();

        assert_eq!(stub.start_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_see_consistent_snapshots() {
        let stub = Arc::new(StubBackend::new());
        let manager = manager(&stub, settings(Duration::from_secs(5), Duration::from_secs(1)));
        let url = "http://127.0.0.1:30000";

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    for _ in 0..2_000 {
                        let status = manager.current_state();
                        match status.state {
                            LifecycleState::Ready => {
                                assert_eq!(status.consecutive_failures, 0);
                                assert!(status.health.as_ref().unwrap().healthy);
                                assert!(status.pid.is_some());
                            }
                            LifecycleState::Degraded => {
                                assert!(status.consecutive_failures >= 1);
                                assert!(status.consecutive_failures < 3);
                                assert!(status.last_error.is_some());
                            }
                            LifecycleState::Stopped => {
                                assert_eq!(status, BackendStatus::default());
                            }
                            LifecycleState::Failed => {
                                assert!(status.last_error.is_some());
                                assert_eq!(status.pid, None);
                            }
                            _ => {}
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for round in 0..200u32 {
            manager.transition(LifecycleEvent::StartRequested);
            manager.transition(LifecycleEvent::Spawned { pid: round + 1 });
            manager.transition(LifecycleEvent::HealthPassed(
                HealthSnapshot::healthy(url, "HTTP 200"),
            ));
            for _ in 0..3 {
                manager.transition(LifecycleEvent::HealthFailed {
                    snapshot: HealthSnapshot::unhealthy(url, "timeout"),
                    error: HealthCheckError::Timeout(Duration::from_secs(5)),
                });
            }
            manager.transition(LifecycleEvent::StopRequested);
            manager.transition(LifecycleEvent::Terminated);
            tokio::task::yield_now().await;
        }

        for reader in readers {
            reader.await.unwrap();
        }
    }
}
