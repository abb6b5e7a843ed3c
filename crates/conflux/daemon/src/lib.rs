//! Conflux worker daemon library
//!
//! - Configuration loading
//! - Built-in flows
//! - Worker wiring and lifecycle
//! - Tracing setup

pub mod config;
pub mod flows;
pub mod telemetry;
pub mod worker;

pub use config::DaemonConfig;
pub use worker::{shutdown_signal, Worker};
