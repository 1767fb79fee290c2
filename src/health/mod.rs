//! Backend readiness probing

pub mod poller;

pub use poller::{HealthCheckError, HealthPoller, HealthSnapshot};
