//! Subprocess-based backends: one supervised engine process plus its health probe

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;

use super::Backend;
use crate::config::BackendConfig;
use crate::health::{HealthCheckError, HealthPoller, HealthSnapshot};
use crate::supervisor::{LaunchSpec, ProcessHandle, ProcessSupervisor, SupervisorError};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// One engine process slot: at most one live [`ProcessHandle`] at a time
#[derive(Debug)]
pub(crate) struct ManagedProcess {
    supervisor: ProcessSupervisor,
    launch: LaunchSpec,
    host: String,
    port: u16,
    handle: Mutex<Option<ProcessHandle>>,
}

impl ManagedProcess {
    pub fn new(launch: LaunchSpec, host: &str, port: u16) -> Self {
        Self::with_supervisor(ProcessSupervisor::default(), launch, host, port)
    }

    pub fn with_supervisor(
        supervisor: ProcessSupervisor,
        launch: LaunchSpec,
        host: &str,
        port: u16,
    ) -> Self {
        Self {
            supervisor,
            launch,
            host: host.to_string(),
            port,
            handle: Mutex::new(None),
        }
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.launch
    }

    pub async fn start(&self) -> Result<u32, SupervisorError> {
        let mut slot = self.handle.lock().await;

        if let Some(handle) = slot.as_mut() {
            if self.supervisor.is_alive(handle) {
                warn!(pid = handle.pid(), "{} server already running", self.launch.label);
                return Ok(handle.pid());
            }
            warn!("Previous {} process is dead, cleaning up", self.launch.label);
            *slot = None;
        }

        self.ensure_port_free().await?;

        let handle = self.supervisor.spawn(&self.launch).await?;
        let pid = handle.pid();
        *slot = Some(handle);
        Ok(pid)
    }

    pub async fn stop(&self, grace: Duration) -> Result<(), SupervisorError> {
        let mut slot = self.handle.lock().await;
        match slot.take() {
            Some(mut handle) => self.supervisor.terminate(&mut handle, grace).await,
            None => Ok(()),
        }
    }

    /// `None` while the process is alive, otherwise why it is gone
    pub async fn exit_reason(&self) -> Option<String> {
        let mut slot = self.handle.lock().await;
        match slot.as_mut() {
            None => Some(format!("{} process is not running", self.launch.label)),
            Some(handle) => {
                if self.supervisor.is_alive(handle) {
                    None
                } else {
                    Some(
                        handle
                            .exit_reason()
                            .unwrap_or_else(|| "Backend process exited unexpectedly".to_string()),
                    )
                }
            }
        }
    }

    /// Refuse to launch when another process already owns the engine port
    async fn ensure_port_free(&self) -> Result<(), SupervisorError> {
        let addr = format!("{}:{}", self.host, self.port);
        match timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Err(SupervisorError::SpawnFailed {
                program: self.launch.program.clone(),
                reason: format!("port {} already in use", addr),
            }),
            _ => Ok(()),
        }
    }
}

/// Engine launched from a [`LaunchSpec`] and health-checked over HTTP. The engine
/// name is the launch label.
#[derive(Debug)]
pub struct ProcessBackend {
    process: ManagedProcess,
    poller: HealthPoller,
}

impl ProcessBackend {
    pub fn new(config: &BackendConfig, launch: LaunchSpec) -> Result<Self, reqwest::Error> {
        let poller = HealthPoller::new(&config.base_url(), config.health_check_timeout)?;

        Ok(ProcessBackend {
            process: ManagedProcess::new(launch, &config.host, config.port),
            poller,
        })
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        self.process.launch_spec()
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        &self.process.launch_spec().label
    }

    fn base_url(&self) -> &str {
        self.poller.backend_url()
    }

    async fn start(&self) -> Result<u32, SupervisorError> {
        self.process.start().await
    }

    async fn stop(&self, grace: Duration) -> Result<(), SupervisorError> {
        self.process.stop(grace).await
    }

    async fn health_check(&self) -> Result<HealthSnapshot, HealthCheckError> {
        self.poller.check().await
    }

    async fn exit_reason(&self) -> Option<String> {
        self.process.exit_reason().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn sleeper(port: u16) -> ManagedProcess {
        ManagedProcess::with_supervisor(
            ProcessSupervisor::new(Duration::from_millis(100)),
            LaunchSpec::new("sleeper", "sleep").arg("30"),
            "127.0.0.1",
            port,
        )
    }

    #[tokio::test]
    async fn test_refuses_occupied_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = sleeper(port).start().await.unwrap_err();
        match err {
            SupervisorError::SpawnFailed { reason, .. } => {
                assert!(reason.contains("already in use"), "{reason}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let process = sleeper(free_port());
        assert!(process.exit_reason().await.is_some());

        let pid = process.start().await.unwrap();
        assert_eq!(process.exit_reason().await, None);

        // Second start reuses the live process
        assert_eq!(process.start().await.unwrap(), pid);

        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(process.exit_reason().await.is_some());

        // Stopping with nothing running is fine
        process.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_reason_reports_status_and_stderr() {
        let process = ManagedProcess::with_supervisor(
            ProcessSupervisor::new(Duration::from_millis(100)),
            LaunchSpec::new("crasher", "sh")
                .arg("-c")
                .arg("sleep 0.3; echo 'RuntimeError: CUDA out of memory' >&2; exit 1"),
            "127.0.0.1",
            free_port(),
        );

        process.start().await.unwrap();
        assert_eq!(process.exit_reason().await, None);

        tokio::time::sleep(Duration::from_millis(700)).await;
        let reason = process.exit_reason().await.unwrap();
        assert!(reason.contains("exit status: 1"), "{reason}");
        assert!(reason.contains("CUDA out of memory"), "{reason}");
    }

    #[test]
    fn test_process_backend_identity() {
        let config = BackendConfig {
            kind: BackendKind::Sglang,
            model_path: PathBuf::from("/models/qwen"),
            host: "127.0.0.1".to_string(),
            port: 30000,
            python: "python3".to_string(),
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            work_dir: None,
            startup_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(2),
            health_check_timeout: Duration::from_secs(5),
            max_consecutive_failures: 3,
        };

        let backend =
            ProcessBackend::new(&config, LaunchSpec::new("sglang", "python3")).unwrap();
        assert_eq!(backend.name(), "sglang");
        assert_eq!(backend.base_url(), "http://127.0.0.1:30000");
        assert_eq!(backend.launch_spec().program, "python3");
    }
}
