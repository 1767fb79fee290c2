//! Configuration management for the inference server
//!
//! Values are resolved with the precedence CLI > `INFERENCE_*` environment >
//! TOML config file > built-in defaults, then validated once. The resulting
//! [`Config`] is never mutated afterwards.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";
const DEFAULT_BACKEND_PORT: u16 = 30000;
const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
const DEFAULT_PROXY_PORT: u16 = 8080;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 2;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_HEALTH_FAILURES: u32 = 3;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_PYTHON: &str = "python3";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Inference engine family to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sglang,
    Vllm,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Sglang => "sglang",
            BackendKind::Vllm => "vllm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic inference server
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "deterministic-inference-server")]
#[command(about = "OpenAI-compatible proxy supervising a local inference engine", long_about = None)]
pub struct Args {
    /// TOML configuration file (CLI and environment values override it)
    #[arg(long, env = "INFERENCE_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Path to the model directory (required)
    #[arg(long, env = "INFERENCE_MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Inference backend type [default: sglang]
    #[arg(long, env = "INFERENCE_BACKEND", value_enum)]
    pub backend: Option<BackendKind>,

    /// Backend server host [default: 127.0.0.1]
    #[arg(long, env = "INFERENCE_BACKEND_HOST")]
    pub backend_host: Option<String>,

    /// Backend server port [default: 30000]
    #[arg(long, env = "INFERENCE_BACKEND_PORT")]
    pub backend_port: Option<u16>,

    /// Seconds to wait for the backend to report healthy [default: 300]
    #[arg(long, env = "INFERENCE_BACKEND_STARTUP_TIMEOUT")]
    pub backend_startup_timeout: Option<u64>,

    /// Health check interval in seconds [default: 2]
    #[arg(long, env = "INFERENCE_HEALTH_INTERVAL")]
    pub health_interval: Option<u64>,

    /// Health check timeout in seconds [default: 5]
    #[arg(long, env = "INFERENCE_HEALTH_TIMEOUT")]
    pub health_timeout: Option<u64>,

    /// Consecutive failed health checks before the backend is declared failed [default: 3]
    #[arg(long, env = "INFERENCE_MAX_HEALTH_FAILURES")]
    pub max_health_failures: Option<u32>,

    /// Proxy server host [default: 127.0.0.1]
    #[arg(long, env = "INFERENCE_PROXY_HOST")]
    pub proxy_host: Option<String>,

    /// Proxy server port [default: 8080]
    #[arg(long, env = "INFERENCE_PROXY_PORT")]
    pub proxy_port: Option<u16>,

    /// Per-request forwarding timeout in seconds [default: 300]
    #[arg(long, env = "INFERENCE_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Grace period in seconds for draining requests and stopping the backend [default: 30]
    #[arg(long, env = "INFERENCE_SHUTDOWN_GRACE")]
    pub shutdown_grace: Option<u64>,

    /// Python interpreter used to launch the backend [default: python3]
    #[arg(long, env = "INFERENCE_PYTHON")]
    pub python: Option<String>,

    /// Extra argument appended to the backend command line (repeatable)
    #[arg(long = "backend-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub backend_args: Vec<String>,

    /// Log level or filter directive, used when RUST_LOG is unset [default: info]
    #[arg(long, env = "INFERENCE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Write logs to this exact file instead of the rotating log directory
    #[arg(long, env = "INFERENCE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Directory for rotating log files [default: ~/.cache/deterministic-inference/logs]
    #[arg(long, env = "INFERENCE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Also log to the console (true/false) [default: true]
    #[arg(long, env = "INFERENCE_LOG_TO_CONSOLE", value_name = "BOOL")]
    pub log_to_console: Option<bool>,
}

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub model_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_to_console: Option<bool>,
    pub backend: BackendSection,
    pub proxy: ProxySection,
    pub health: HealthSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSection {
    #[serde(rename = "type")]
    pub kind: Option<BackendKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub startup_timeout: Option<u64>,
    pub python: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub request_timeout: Option<u64>,
    pub shutdown_grace: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSection {
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
    pub max_consecutive_failures: Option<u32>,
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {:?}", path.as_ref()))
    }
}

/// Settings for the supervised inference engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub model_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub python: String,
    pub extra_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub max_consecutive_failures: u32,
}

impl BackendConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Settings for the client-facing HTTP listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl ProxyConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Log sinks. A file is always written; the console is optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// Exact log file, not rotated
    pub file: Option<PathBuf>,
    /// Directory for daily-rotated files when `file` is unset
    pub dir: Option<PathBuf>,
    pub to_console: bool,
}

/// Fully resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub proxy: ProxyConfig,
    pub log: LogConfig,
}

impl Config {
    /// Resolve CLI arguments (and the config file they may point at) into a
    /// validated configuration
    pub fn load(args: Args) -> Result<Self> {
        let file = match &args.config_file {
            Some(path) => ConfigFile::from_file(path)?,
            None => ConfigFile::default(),
        };

        let config = Self::resolve(args, file)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve(args: Args, file: ConfigFile) -> Result<Self> {
        let model_path = args.model_path.or(file.model_path).context(
            "model_path is required (use --model-path, INFERENCE_MODEL_PATH or the config file)",
        )?;

        let extra_args = if args.backend_args.is_empty() {
            file.backend.args
        } else {
            args.backend_args
        };

        let backend = BackendConfig {
            kind: args
                .backend
                .or(file.backend.kind)
                .unwrap_or(BackendKind::Sglang),
            model_path,
            host: args
                .backend_host
                .or(file.backend.host)
                .unwrap_or_else(|| DEFAULT_BACKEND_HOST.to_string()),
            port: args
                .backend_port
                .or(file.backend.port)
                .unwrap_or(DEFAULT_BACKEND_PORT),
            python: args
                .python
                .or(file.backend.python)
                .unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
            extra_args,
            env: file.backend.env,
            work_dir: file.backend.work_dir,
            startup_timeout: Duration::from_secs(
                args.backend_startup_timeout
                    .or(file.backend.startup_timeout)
                    .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
            ),
            health_check_interval: Duration::from_secs(
                args.health_interval
                    .or(file.health.interval)
                    .unwrap_or(DEFAULT_HEALTH_INTERVAL_SECS),
            ),
            health_check_timeout: Duration::from_secs(
                args.health_timeout
                    .or(file.health.timeout)
                    .unwrap_or(DEFAULT_HEALTH_TIMEOUT_SECS),
            ),
            max_consecutive_failures: args
                .max_health_failures
                .or(file.health.max_consecutive_failures)
                .unwrap_or(DEFAULT_MAX_HEALTH_FAILURES),
        };

        let proxy = ProxyConfig {
            host: args
                .proxy_host
                .or(file.proxy.host)
                .unwrap_or_else(|| DEFAULT_PROXY_HOST.to_string()),
            port: args
                .proxy_port
                .or(file.proxy.port)
                .unwrap_or(DEFAULT_PROXY_PORT),
            request_timeout: Duration::from_secs(
                args.request_timeout
                    .or(file.proxy.request_timeout)
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            shutdown_grace: Duration::from_secs(
                args.shutdown_grace
                    .or(file.proxy.shutdown_grace)
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            ),
        };

        let log = LogConfig {
            level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            file: args.log_file.or(file.log_file),
            dir: args.log_dir.or(file.log_dir),
            to_console: args.log_to_console.or(file.log_to_console).unwrap_or(true),
        };

        Ok(Config {
            backend,
            proxy,
            log,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let backend = &self.backend;
        let proxy = &self.proxy;

        if backend.model_path.as_os_str().is_empty() {
            bail!("model_path must not be empty");
        }
        if backend.port == 0 {
            bail!("Invalid backend port: 0");
        }
        if proxy.port == 0 {
            bail!("Invalid proxy port: 0");
        }
        if backend.host == proxy.host && backend.port == proxy.port {
            bail!(
                "Backend and proxy cannot both listen on {}:{}",
                proxy.host,
                proxy.port
            );
        }

        for (name, value) in [
            ("backend startup timeout", backend.startup_timeout),
            ("health check interval", backend.health_check_interval),
            ("health check timeout", backend.health_check_timeout),
            ("request timeout", proxy.request_timeout),
        ] {
            if value.is_zero() {
                bail!("Invalid {}: must be at least one second", name);
            }
        }

        if backend.max_consecutive_failures == 0 {
            bail!("Invalid max consecutive health failures: must be at least 1");
        }

        EnvFilter::try_new(&self.log.level)
            .with_context(|| format!("Invalid log level: {}", self.log.level))?;

        if self
            .log
            .file
            .as_ref()
            .is_some_and(|path| path.file_name().is_none())
        {
            bail!("Invalid log file: {:?}", self.log.file);
        }

        Ok(())
    }
}
