use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use kubenap_common::{ANNOTATION_ORIGINAL_REPLICAS, ServiceIdentity, WorkloadSnapshot};
use log::{debug, info, warn};
use serde_json::json;

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("workload {0} not found")]
    NotFound(ServiceIdentity),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("orchestrator request failed: {0}")]
    Transient(String),
    #[error("workload not ready after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Conflict(_) | GatewayError::Transient(_))
    }

    fn from_kube(id: &ServiceIdentity, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => GatewayError::NotFound(id.clone()),
            kube::Error::Api(ae) if ae.code == 409 => GatewayError::Conflict(ae.message),
            other => GatewayError::Transient(other.to_string()),
        }
    }
}

/// Narrow view of the orchestrator used by the suspend and resume engines.
#[async_trait]
pub trait WorkloadGateway: Send + Sync {
    async fn get_snapshot(&self, id: &ServiceIdentity) -> Result<WorkloadSnapshot, GatewayError>;

    /// Stores the durable marker. A valid marker that is already present is
    /// left untouched.
    async fn record_original_replicas(
        &self,
        id: &ServiceIdentity,
        count: i32,
    ) -> Result<(), GatewayError>;

    async fn set_replicas(&self, id: &ServiceIdentity, count: i32) -> Result<(), GatewayError>;

    /// Polls until every desired replica reports ready.
    async fn wait_until_ready(
        &self,
        id: &ServiceIdentity,
        timeout: Duration,
    ) -> Result<(), GatewayError>;
}

/// Converts a cached or fetched Deployment into a snapshot. Deployments
/// without a name or namespace are skipped.
pub fn snapshot_from_deployment(deployment: &Deployment) -> Option<WorkloadSnapshot> {
    let name = deployment.metadata.name.clone()?;
    let namespace = deployment.metadata.namespace.clone()?;
    // The API server defaults an unset replica count to 1.
    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let ready_replicas = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    let annotations = deployment.metadata.annotations.clone().unwrap_or_default();

    Some(WorkloadSnapshot::from_annotations(
        ServiceIdentity::new(namespace, name),
        replicas,
        ready_replicas,
        annotations,
    ))
}

pub struct KubeGateway {
    client: Client,
    poll_interval: Duration,
}

impl KubeGateway {
    pub fn new(client: Client, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    fn deployments(&self, id: &ServiceIdentity) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &id.namespace)
    }

    async fn fetch(&self, id: &ServiceIdentity) -> Result<Deployment, GatewayError> {
        self.deployments(id)
            .get(&id.name)
            .await
            .map_err(|e| GatewayError::from_kube(id, e))
    }
}

#[async_trait]
impl WorkloadGateway for KubeGateway {
    async fn get_snapshot(&self, id: &ServiceIdentity) -> Result<WorkloadSnapshot, GatewayError> {
        let deployment = self.fetch(id).await?;
        snapshot_from_deployment(&deployment).ok_or_else(|| GatewayError::NotFound(id.clone()))
    }

    async fn record_original_replicas(
        &self,
        id: &ServiceIdentity,
        count: i32,
    ) -> Result<(), GatewayError> {
        let deployment = self.fetch(id).await?;
        let snapshot = snapshot_from_deployment(&deployment)
            .ok_or_else(|| GatewayError::NotFound(id.clone()))?;
        if let Some(existing) = snapshot.original_replicas {
            debug!(target: "gateway", "{} already has original replicas {} recorded", id, existing);
            return Ok(());
        }

        // Carrying the observed resourceVersion turns a racing writer into a 409.
        let patch = json!({
            "metadata": {
                "resourceVersion": deployment.metadata.resource_version,
                "annotations": {
                    ANNOTATION_ORIGINAL_REPLICAS: count.to_string()
                }
            }
        });
        self.deployments(id)
            .patch(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| GatewayError::from_kube(id, e))?;

        info!(target: "gateway", "Recorded original replicas {} for {}", count, id);
        Ok(())
    }

    async fn set_replicas(&self, id: &ServiceIdentity, count: i32) -> Result<(), GatewayError> {
        let mut deployment = self.fetch(id).await?;
        let spec = deployment.spec.get_or_insert_with(Default::default);
        if spec.replicas == Some(count) {
            return Ok(());
        }
        spec.replicas = Some(count);

        self.deployments(id)
            .replace(&id.name, &PostParams::default(), &deployment)
            .await
            .map_err(|e| GatewayError::from_kube(id, e))?;

        info!(target: "gateway", "Set replicas of {} to {}", id, count);
        Ok(())
    }

    async fn wait_until_ready(
        &self,
        id: &ServiceIdentity,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let poll = async {
            loop {
                match self.get_snapshot(id).await {
                    Ok(snapshot) if snapshot.is_ready() => return Ok(()),
                    Ok(snapshot) => debug!(
                        target: "gateway",
                        "{} has {}/{} replicas ready",
                        id, snapshot.ready_replicas, snapshot.replicas
                    ),
                    Err(GatewayError::NotFound(missing)) => {
                        return Err(GatewayError::NotFound(missing));
                    }
                    Err(e) => warn!(target: "gateway", "Readiness poll for {} failed: {}", id, e),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .unwrap_or_else(|_| Err(GatewayError::Timeout(timeout)))
    }
}
