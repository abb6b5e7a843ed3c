//! Deployment resolution
//!
//! Everything that can go wrong before a flow run exists is reported here as
//! [`DeploymentError::Resolution`]: unknown deployment, malformed
//! entrypoint, or source that cannot be fetched.

use crate::error::{DeploymentError, Result};
use crate::registry::DeploymentRegistry;
use crate::source::SourceFetcher;
use conflux_types::{Deployment, DeploymentId, Entrypoint};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// A deployment with its entrypoint parsed and source available locally
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDeployment {
    pub deployment: Deployment,
    pub entrypoint: Entrypoint,
    pub local_path: PathBuf,
}

/// Resolves deployments against a registry and a source fetcher
#[derive(Clone)]
pub struct DeploymentResolver {
    registry: Arc<dyn DeploymentRegistry>,
    fetcher: Arc<dyn SourceFetcher>,
}

impl DeploymentResolver {
    pub fn new(registry: Arc<dyn DeploymentRegistry>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self { registry, fetcher }
    }

    pub fn registry(&self) -> &Arc<dyn DeploymentRegistry> {
        &self.registry
    }

    pub async fn resolve(&self, id: &DeploymentId) -> Result<ResolvedDeployment> {
        let deployment = self
            .registry
            .resolve(id)
            .await
            .map_err(|e| DeploymentError::resolution(id.to_string(), e))?;
        self.prepare(deployment).await
    }

    pub async fn resolve_by_name(&self, name: &str) -> Result<ResolvedDeployment> {
        let deployment = self
            .registry
            .resolve_by_name(name)
            .await
            .map_err(|e| DeploymentError::resolution(name, e))?;
        self.prepare(deployment).await
    }

    /// Parse the entrypoint and fetch the source of an already loaded deployment
    pub async fn prepare(&self, deployment: Deployment) -> Result<ResolvedDeployment> {
        let entrypoint = deployment
            .parsed_entrypoint()
            .map_err(|e| DeploymentError::resolution(&deployment.name, e))?;
        let local_path = self
            .fetcher
            .pull(&deployment.source, &entrypoint)
            .await
            .map_err(|e| {
                warn!(deployment = %deployment.name, error = %e, "Source fetch failed");
                DeploymentError::resolution(&deployment.name, e)
            })?;
        Ok(ResolvedDeployment {
            deployment,
            entrypoint,
            local_path,
        })
    }
}

impl std::fmt::Debug for DeploymentResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentResolver").finish_non_exhaustive()
    }
}
