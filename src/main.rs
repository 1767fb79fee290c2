//! Deterministic Inference Server
//! Launches the inference engine, waits for it to become healthy and serves
//! the OpenAI-compatible proxy until SIGINT/SIGTERM.

use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

use deterministic_inference::server::shutdown_signal;
use deterministic_inference::{logging, Args, Config, ServerExit, ServerOrchestrator};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ServerExit::Fatal.into();
        }
    };

    // Flushes the log file on drop
    let _log_guard = match logging::init(&config.log) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ServerExit::Fatal.into();
        }
    };

    info!("Backend: {} at {}", config.backend.kind, config.backend.base_url());
    info!("Proxy: http://{}", config.proxy.bind_address());

    let orchestrator = match ServerOrchestrator::new(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to initialize backend: {:#}", e);
            return ServerExit::Fatal.into();
        }
    };

    // Handle graceful shutdown
    let token = orchestrator.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    let exit = orchestrator.run().await;
    info!(code = exit.code(), "Exiting");
    exit.into()
}
