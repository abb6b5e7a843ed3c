//! Deployment registry
//!
//! Deployments are upserted by name. Re-registering a name keeps its id and
//! bumps its version; flow runs already created from the old version are
//! unaffected because they snapshot what they need at creation.

use crate::error::{DeploymentError, Result};
use crate::schedule;
use async_trait::async_trait;
use conflux_types::{Deployment, DeploymentId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

/// Storage for deployments
#[async_trait]
pub trait DeploymentRegistry: Send + Sync {
    /// Create or update a deployment by name, returning its id
    async fn register(&self, deployment: Deployment) -> Result<DeploymentId>;

    async fn resolve(&self, id: &DeploymentId) -> Result<Deployment>;

    async fn resolve_by_name(&self, name: &str) -> Result<Deployment>;

    /// All deployments, ordered by name
    async fn list(&self) -> Result<Vec<Deployment>>;

    /// Stop scheduling a deployment; manual runs stay possible
    async fn pause(&self, id: &DeploymentId) -> Result<()>;

    async fn resume(&self, id: &DeploymentId) -> Result<()>;

    async fn delete(&self, id: &DeploymentId) -> Result<Deployment>;
}

/// Validate a deployment before it is stored
pub fn validate(deployment: &Deployment) -> Result<()> {
    deployment.parsed_entrypoint()?;
    if let Some(schedule) = &deployment.schedule {
        schedule::validate(schedule)?;
    }
    Ok(())
}

/// In-memory deployment registry
#[derive(Debug, Default)]
pub struct InMemoryDeploymentRegistry {
    deployments: DashMap<DeploymentId, Deployment>,
    names: DashMap<String, DeploymentId>,
}

impl InMemoryDeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_paused(&self, id: &DeploymentId, paused: bool) -> Result<()> {
        let mut deployment = self
            .deployments
            .get_mut(id)
            .ok_or_else(|| DeploymentError::NotFound(id.to_string()))?;
        deployment.paused = paused;
        info!(deployment = %deployment.name, paused, "Deployment schedule toggled");
        Ok(())
    }
}

#[async_trait]
impl DeploymentRegistry for InMemoryDeploymentRegistry {
    async fn register(&self, mut deployment: Deployment) -> Result<DeploymentId> {
        validate(&deployment)?;

        // The name entry serializes concurrent registrations of one name
        match self.names.entry(deployment.name.clone()) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let version = self
                    .deployments
                    .get(&id)
                    .map(|current| current.version)
                    .unwrap_or(0);
                deployment.id = id;
                deployment.version = version + 1;
                info!(
                    deployment = %deployment.name,
                    deployment_id = %id,
                    version = deployment.version,
                    "Deployment updated"
                );
                self.deployments.insert(id, deployment);
                Ok(id)
            }
            Entry::Vacant(slot) => {
                let id = deployment.id;
                info!(deployment = %deployment.name, deployment_id = %id, "Deployment registered");
                self.deployments.insert(id, deployment);
                slot.insert(id);
                Ok(id)
            }
        }
    }

    async fn resolve(&self, id: &DeploymentId) -> Result<Deployment> {
        self.deployments
            .get(id)
            .map(|d| d.value().clone())
            .ok_or_else(|| DeploymentError::NotFound(id.to_string()))
    }

    async fn resolve_by_name(&self, name: &str) -> Result<Deployment> {
        let id = self
            .names
            .get(name)
            .map(|id| *id.value())
            .ok_or_else(|| DeploymentError::NotFound(name.to_string()))?;
        self.resolve(&id).await
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> =
            self.deployments.iter().map(|d| d.value().clone()).collect();
        deployments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(deployments)
    }

    async fn pause(&self, id: &DeploymentId) -> Result<()> {
        self.set_paused(id, true)
    }

    async fn resume(&self, id: &DeploymentId) -> Result<()> {
        self.set_paused(id, false)
    }

    async fn delete(&self, id: &DeploymentId) -> Result<Deployment> {
        let (_, deployment) = self
            .deployments
            .remove(id)
            .ok_or_else(|| DeploymentError::NotFound(id.to_string()))?;
        self.names.remove(&deployment.name);
        info!(deployment = %deployment.name, deployment_id = %id, "Deployment deleted");
        Ok(deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conflux_types::{FlowRun, Parameters, Schedule, SourceLocation};
    use serde_json::json;

    fn deployment(name: &str) -> Deployment {
        Deployment::new(
            name,
            "etl",
            SourceLocation::local("/srv/flows"),
            "etl.rs:etl",
            "default",
        )
    }

    #[tokio::test]
    async fn test_register_then_resolve_round_trips() {
        let registry = InMemoryDeploymentRegistry::new();
        let original = deployment("nightly").with_schedule(Schedule::cron("0 2 * * *"));
        let id = registry.register(original.clone()).await.unwrap();

        assert_eq!(id, original.id);
        assert_eq!(registry.resolve(&id).await.unwrap(), original);
        assert_eq!(registry.resolve_by_name("nightly").await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_reregistration_keeps_id_and_spares_existing_runs() {
        let registry = InMemoryDeploymentRegistry::new();
        let mut params = Parameters::new();
        params.insert("region".into(), json!("eu"));
        let id = registry
            .register(deployment("nightly").with_parameters(params))
            .await
            .unwrap();

        let first = registry.resolve(&id).await.unwrap();
        let run = FlowRun::from_deployment(&first, Parameters::new(), Utc::now());

        let mut params = Parameters::new();
        params.insert("region".into(), json!("us"));
        let second_id = registry
            .register(deployment("nightly").with_parameters(params))
            .await
            .unwrap();
        assert_eq!(second_id, id);

        let updated = registry.resolve(&id).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.parameters["region"], json!("us"));
        assert_eq!(run.parameters["region"], json!("eu"));
    }

    #[tokio::test]
    async fn test_invalid_schedule_rejected() {
        let registry = InMemoryDeploymentRegistry::new();
        let result = registry
            .register(deployment("broken").with_schedule(Schedule::cron("every tuesday")))
            .await;
        assert!(matches!(result, Err(DeploymentError::InvalidSchedule(_))));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_entrypoint_rejected() {
        let registry = InMemoryDeploymentRegistry::new();
        let mut broken = deployment("broken");
        broken.entrypoint = "etl.rs".into();
        assert!(matches!(
            registry.register(broken).await,
            Err(DeploymentError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_resume_delete() {
        let registry = InMemoryDeploymentRegistry::new();
        let id = registry
            .register(deployment("hourly").with_schedule(Schedule::cron("0 * * * *")))
            .await
            .unwrap();

        registry.pause(&id).await.unwrap();
        assert!(!registry.resolve(&id).await.unwrap().is_schedule_active());
        registry.resume(&id).await.unwrap();
        assert!(registry.resolve(&id).await.unwrap().is_schedule_active());

        registry.delete(&id).await.unwrap();
        assert!(matches!(
            registry.resolve(&id).await,
            Err(DeploymentError::NotFound(_))
        ));
        assert!(registry.resolve_by_name("hourly").await.is_err());
        assert!(registry.pause(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_sorted_by_name() {
        let registry = InMemoryDeploymentRegistry::new();
        registry.register(deployment("b")).await.unwrap();
        registry.register(deployment("a")).await.unwrap();
        let names: Vec<_> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
