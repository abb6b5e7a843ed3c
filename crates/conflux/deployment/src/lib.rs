//! Conflux Deployment - named, schedulable flow configurations
//!
//! A deployment binds a flow's source and entrypoint to parameters, an
//! optional schedule and a target work pool. This crate stores deployments,
//! evaluates their schedules and resolves them into runnable form.

#![deny(unsafe_code)]

mod error;
mod registry;
mod resolver;
pub mod schedule;
mod source;

pub use error::{DeploymentError, Result};
pub use registry::{validate, DeploymentRegistry, InMemoryDeploymentRegistry};
pub use resolver::{DeploymentResolver, ResolvedDeployment};
pub use source::{LocalSourceFetcher, SourceFetcher};
