//! Deterministic inference server
//!
//! Supervises one local inference engine (SGLang or vLLM) and exposes an
//! OpenAI-compatible HTTP API in front of it that only forwards requests while
//! the engine is actually healthy.

pub mod backend;
pub mod config;
pub mod handlers;
pub mod health;
pub mod lifecycle;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod supervisor;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::{Args, Config};
pub use server::{ServerExit, ServerOrchestrator};
