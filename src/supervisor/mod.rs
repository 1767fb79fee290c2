//! OS-level supervision of the inference engine subprocess

pub mod process_manager;

pub use process_manager::{LaunchSpec, ProcessHandle, ProcessSupervisor};

use thiserror::Error;

/// Errors raised while spawning or terminating a backend process
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed to terminate process {pid}: {source}")]
    Terminate {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}
