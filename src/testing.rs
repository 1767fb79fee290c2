//! In-memory [`Backend`] for exercising the lifecycle manager and proxy

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::backend::Backend;
use crate::health::{HealthCheckError, HealthSnapshot};
use crate::supervisor::SupervisorError;

pub(crate) struct StubBackend {
    base_url: String,
    /// Probe results served first, in order
    script: Mutex<VecDeque<Result<(), HealthCheckError>>>,
    /// Once the script is exhausted: healthy this long after `start`, or never
    healthy_after: Option<Duration>,
    spawn_error: Option<String>,
    started_at: Mutex<Option<Instant>>,
    running: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl StubBackend {
    pub const PID: u32 = 4242;
    pub const EXIT_REASON: &'static str = "Backend process exited (signal: 9 (SIGKILL))";

    pub fn new() -> Self {
        StubBackend {
            base_url: "http://127.0.0.1:30000".to_string(),
            script: Mutex::new(VecDeque::new()),
            healthy_after: Some(Duration::ZERO),
            spawn_error: None,
            started_at: Mutex::new(None),
            running: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn healthy_after(mut self, delay: Duration) -> Self {
        self.healthy_after = Some(delay);
        self
    }

    pub fn never_healthy(mut self) -> Self {
        self.healthy_after = None;
        self
    }

    pub fn script(self, results: Vec<Result<(), HealthCheckError>>) -> Self {
        self.script.lock().unwrap().extend(results);
        self
    }

    pub fn failing_spawn(mut self, reason: &str) -> Self {
        self.spawn_error = Some(reason.to_string());
        self
    }

    /// Simulate the engine process dying
    pub fn crash(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn probe(&self) -> Result<(), HealthCheckError> {
        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }

        let started_at = *self.started_at.lock().unwrap();
        match (started_at, self.healthy_after) {
            (Some(started_at), Some(delay)) if Instant::now() >= started_at + delay => Ok(()),
            _ => Err(HealthCheckError::ConnectionRefused(self.base_url.clone())),
        }
    }
}

#[async_trait]
impl Backend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn start(&self) -> Result<u32, SupervisorError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.spawn_error {
            return Err(SupervisorError::SpawnFailed {
                program: "stub".to_string(),
                reason: reason.clone(),
            });
        }

        *self.started_at.lock().unwrap() = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);
        Ok(Self::PID)
    }

    async fn stop(&self, _grace: Duration) -> Result<(), SupervisorError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthSnapshot, HealthCheckError> {
        self.probe()
            .map(|()| HealthSnapshot::healthy(&self.base_url, "HTTP 200"))
    }

    async fn exit_reason(&self) -> Option<String> {
        if self.running.load(Ordering::SeqCst) {
            None
        } else {
            Some(Self::EXIT_REASON.to_string())
        }
    }
}
