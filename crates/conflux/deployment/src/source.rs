//! Fetching deployment source code

use crate::error::{DeploymentError, Result};
use async_trait::async_trait;
use conflux_types::{Entrypoint, SourceLocation};
use std::path::PathBuf;
use tracing::debug;

/// Makes a deployment's flow code available locally
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Return the local directory holding `entrypoint`
    async fn pull(&self, source: &SourceLocation, entrypoint: &Entrypoint) -> Result<PathBuf>;
}

/// Fetcher for sources already present on the worker's filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalSourceFetcher {
    verify_entrypoint: bool,
}

impl LocalSourceFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also require the entrypoint file to exist under the source directory
    pub fn verify_entrypoint(mut self, verify: bool) -> Self {
        self.verify_entrypoint = verify;
        self
    }
}

fn fetch_error(source: &SourceLocation, reason: impl ToString) -> DeploymentError {
    DeploymentError::SourceFetch {
        source_location: source.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl SourceFetcher for LocalSourceFetcher {
    async fn pull(&self, source: &SourceLocation, entrypoint: &Entrypoint) -> Result<PathBuf> {
        let path = match source {
            SourceLocation::Local { path } => path,
            SourceLocation::Remote { .. } => {
                return Err(fetch_error(
                    source,
                    "remote sources are not supported by the local fetcher",
                ))
            }
        };

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| fetch_error(source, e))?;
        if !metadata.is_dir() {
            return Err(fetch_error(source, "not a directory"));
        }

        if self.verify_entrypoint {
            let file = path.join(&entrypoint.path);
            if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
                return Err(fetch_error(
                    source,
                    format!("entrypoint file {} not found", file.display()),
                ));
            }
        }

        debug!(source = %source, entrypoint = %entrypoint, "Source available");
        Ok(path.clone())
    }
}
