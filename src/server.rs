//! Process-level orchestration: backend startup, HTTP serving, shutdown

use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{build_backend, Backend};
use crate::config::Config;
use crate::handlers::{create_router, AppState};
use crate::lifecycle::{BackendLifecycleManager, LifecycleSettings, ReadyOutcome};
use crate::proxy::ProxyForwarder;

/// How a run ended; maps onto the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// Shut down on request, including during backend startup
    Clean,
    /// Configuration or unexpected runtime error
    Fatal,
    /// The backend failed to spawn or never reported healthy
    BackendNotReady,
    /// The proxy listener could not be bound
    BindFailed,
}

impl ServerExit {
    pub fn code(self) -> u8 {
        match self {
            ServerExit::Clean => 0,
            ServerExit::Fatal => 1,
            ServerExit::BackendNotReady => 2,
            ServerExit::BindFailed => 3,
        }
    }
}

impl From<ServerExit> for ExitCode {
    fn from(exit: ServerExit) -> Self {
        ExitCode::from(exit.code())
    }
}

pub struct ServerOrchestrator {
    config: Config,
    manager: Arc<BackendLifecycleManager>,
    shutdown: CancellationToken,
}

impl ServerOrchestrator {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let backend = build_backend(&config.backend)?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Self {
        let settings = LifecycleSettings::from_config(&config);
        ServerOrchestrator {
            manager: Arc::new(BackendLifecycleManager::new(backend, settings)),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling this token starts a graceful shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn manager(&self) -> &Arc<BackendLifecycleManager> {
        &self.manager
    }

    pub async fn run(&self) -> ServerExit {
        let grace = self.config.proxy.shutdown_grace;
        let startup_timeout = self.config.backend.startup_timeout;

        info!(
            backend = %self.config.backend.kind,
            model = %self.config.backend.model_path.display(),
            "Starting deterministic inference server"
        );

        if let Err(e) = self.manager.start().await {
            error!("Backend could not be started: {}", e);
            return ServerExit::BackendNotReady;
        }

        info!("Waiting up to {:?} for backend to become ready", startup_timeout);
        let outcome = tokio::select! {
            outcome = self.manager.await_ready(startup_timeout) => outcome,
            _ = self.shutdown.cancelled() => ReadyOutcome::ShuttingDown,
        };

        match outcome {
            ReadyOutcome::Ready => info!("Backend is ready"),
            ReadyOutcome::ShuttingDown => {
                info!("Shutdown requested while backend was starting");
                self.manager.stop(grace).await;
                return ServerExit::Clean;
            }
            ReadyOutcome::TimedOut => {
                error!("Backend did not become ready within {:?}", startup_timeout);
                self.manager.stop(grace).await;
                return ServerExit::BackendNotReady;
            }
            ReadyOutcome::Failed(reason) => {
                error!("Backend failed to start: {}", reason);
                self.manager.stop(grace).await;
                return ServerExit::BackendNotReady;
            }
        }

        let exit = self.serve().await;
        self.manager.stop(grace).await;
        info!("Server shutdown complete");
        exit
    }

    async fn serve(&self) -> ServerExit {
        let grace = self.config.proxy.shutdown_grace;
        let addr = self.config.proxy.bind_address();

        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind {}: {}", addr, e);
                return ServerExit::BindFailed;
            }
        };

        let forwarder =
            match ProxyForwarder::new(self.manager.clone(), self.config.proxy.request_timeout) {
                Ok(forwarder) => Arc::new(forwarder),
                Err(e) => {
                    error!("Failed to create HTTP client: {}", e);
                    return ServerExit::Fatal;
                }
            };

        let app = create_router(AppState {
            manager: self.manager.clone(),
            forwarder,
        });
        info!("Proxy listening on http://{}", addr);

        let token = self.shutdown.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        });

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!("Draining in-flight requests (grace period {:?})", grace);
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(Ok(Ok(()))) => info!("HTTP server drained"),
                    Ok(Ok(Err(e))) => error!("HTTP server error: {}", e),
                    Ok(Err(e)) => error!("HTTP server task failed: {}", e),
                    Err(_) => {
                        warn!("Grace period elapsed with requests still in flight");
                        server.abort();
                    }
                }
                ServerExit::Clean
            }
            result = &mut server => {
                match result {
                    Ok(Ok(())) => error!("HTTP server stopped unexpectedly"),
                    Ok(Err(e)) => error!("HTTP server error: {}", e),
                    Err(e) => error!("HTTP server task failed: {}", e),
                }
                ServerExit::Fatal
            }
        }
    }
}

/// Resolve when the process receives SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
