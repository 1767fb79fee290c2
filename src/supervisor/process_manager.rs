//! Process management for the inference backend

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use super::SupervisorError;

/// How long a freshly spawned process must survive before spawn reports success
pub const DEFAULT_IMMEDIATE_FAILURE_WINDOW: Duration = Duration::from_millis(500);

/// Number of trailing stderr lines kept for crash diagnostics
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on waiting for the output forwarders after the process is gone
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything needed to launch a backend executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Name used to prefix forwarded output lines
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            work_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Human-readable command line for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A spawned backend process together with its output forwarders.
///
/// Dropping the handle kills the process if it is still running.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: u32,
    child: Child,
    exit_status: Option<ExitStatus>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    log_tasks: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Exit status, if the process has already been observed to exit
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Last lines the process wrote to stderr
    pub fn stderr_tail(&self) -> String {
        let tail = self
            .stderr_tail
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Exit status plus stderr tail, once the process has been observed to exit
    pub fn exit_reason(&self) -> Option<String> {
        let status = self.exit_status?;
        let tail = self.stderr_tail();
        Some(if tail.is_empty() {
            format!("Backend process exited ({status})")
        } else {
            format!("Backend process exited ({status}): {tail}")
        })
    }

    fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        let status = self.child.try_wait()?;
        self.exit_status = status;
        Ok(status)
    }

    async fn drain_logs(&mut self) {
        for task in self.log_tasks.drain(..) {
            if timeout(LOG_DRAIN_TIMEOUT, task).await.is_err() {
                debug!(pid = self.pid, "Output forwarder still running after process exit");
            }
        }
    }
}

/// Spawns, watches and terminates backend processes
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    immediate_failure_window: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_IMMEDIATE_FAILURE_WINDOW)
    }
}

impl ProcessSupervisor {
    pub fn new(immediate_failure_window: Duration) -> Self {
        Self {
            immediate_failure_window,
        }
    }

    /// Launch the process described by `spec` without waiting for readiness.
    ///
    /// The call only blocks for the immediate-failure window: a process that
    /// exits inside it is reported as [`SupervisorError::SpawnFailed`] along
    /// with its exit status and stderr tail.
    pub async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SupervisorError> {
        info!(
            backend = %spec.label,
            command = %spec.command_line(),
            "Spawning backend process"
        );

        let spawn_failed = |reason: String| SupervisorError::SpawnFailed {
            program: spec.program.clone(),
            reason,
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }
        // Own process group so the engine's worker children are signalled with it
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_failed("process exited before a PID was assigned".to_string()))?;
        info!(backend = %spec.label, pid, "Backend process started");

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let mut log_tasks = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            let label = spec.label.clone();
            log_tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!("[{} stdout] {}", label, line);
                }
            }));
        }

        if let Some(stderr) = child.stderr.take() {
            let label = spec.label.clone();
            let tail = Arc::clone(&stderr_tail);
            log_tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[{} stderr] {}", label, line);
                    let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }));
        }

        let mut handle = ProcessHandle {
            label: spec.label.clone(),
            pid,
            child,
            exit_status: None,
            stderr_tail,
            log_tasks,
        };

        sleep(self.immediate_failure_window).await;

        if let Ok(Some(status)) = handle.poll_exit() {
            handle.drain_logs().await;
            let tail = handle.stderr_tail();
            let reason = if tail.is_empty() {
                format!("process exited immediately ({status})")
            } else {
                format!("process exited immediately ({status}): {tail}")
            };
            return Err(spawn_failed(reason));
        }

        Ok(handle)
    }

    /// Non-blocking liveness check. Logs the exit the first time it is seen.
    pub fn is_alive(&self, handle: &mut ProcessHandle) -> bool {
        let already_reported = handle.exit_status.is_some();
        match handle.poll_exit() {
            Ok(None) => true,
            Ok(Some(status)) => {
                if !already_reported {
                    error!(
                        backend = %handle.label,
                        pid = handle.pid,
                        %status,
                        stderr_tail = %handle.stderr_tail(),
                        "Backend process exited"
                    );
                }
                false
            }
            Err(e) => {
                error!(pid = handle.pid, "Error checking process status: {}", e);
                false
            }
        }
    }

    /// Graceful stop: SIGTERM to the process group, wait up to `grace`, then
    /// SIGKILL. Terminating an already exited process is a no-op.
    pub async fn terminate(
        &self,
        handle: &mut ProcessHandle,
        grace: Duration,
    ) -> Result<(), SupervisorError> {
        let pid = handle.pid;
        let terminate_failed = |source: io::Error| SupervisorError::Terminate { pid, source };

        if let Ok(Some(status)) = handle.poll_exit() {
            debug!(pid, %status, "Backend process already exited");
            handle.drain_logs().await;
            return Ok(());
        }

        info!(pid, grace_secs = grace.as_secs_f64(), "Stopping backend process");
        request_stop(handle);

        match timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                handle.exit_status = Some(status);
                info!(pid, %status, "Backend process stopped");
            }
            Ok(Err(e)) => return Err(terminate_failed(e)),
            Err(_) => {
                warn!(pid, "Backend process still alive after {:?}, forcing kill", grace);
                force_kill(handle).map_err(terminate_failed)?;
                let status = handle.child.wait().await.map_err(terminate_failed)?;
                handle.exit_status = Some(status);
                info!(pid, %status, "Backend process killed");
            }
        }

        handle.drain_logs().await;
        Ok(())
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
    let pgid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    match killpg(Pid::from_raw(pgid), signal) {
        // Group already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(unix)]
fn request_stop(handle: &mut ProcessHandle) {
    if let Err(e) = signal_group(handle.pid, Signal::SIGTERM) {
        warn!(pid = handle.pid, "Process group SIGTERM failed: {}, terminating leader only", e);
        let _ = handle.child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_stop(handle: &mut ProcessHandle) {
    // No graceful signal available
    let _ = handle.child.start_kill();
}

#[cfg(unix)]
fn force_kill(handle: &mut ProcessHandle) -> io::Result<()> {
    if let Err(e) = signal_group(handle.pid, Signal::SIGKILL) {
        warn!(pid = handle.pid, "Process group SIGKILL failed: {}", e);
    }
    match handle.child.start_kill() {
        Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn force_kill(handle: &mut ProcessHandle) -> io::Result<()> {
    handle.child.start_kill()
}
