// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Kubernetes-backed [`Orchestrator`].

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{debug, warn};

use crate::deploy::{render_nf_deployment, render_sched_deployment};
use crate::{NfPodSpec, Orchestrator, OrchestratorError, PodInfo, PodStatus};

pub struct KubeOrchestrator {
    client: Client,
    namespace: String,
}

impl KubeOrchestrator {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self, OrchestratorError> {
        let client = Client::try_default().await?;
        Ok(KubeOrchestrator {
            client,
            namespace: namespace.into(),
        })
    }

    fn deployments_api(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn create(&self, name: &str, manifest: serde_json::Value) -> Result<(), OrchestratorError> {
        let dep: Deployment = serde_json::from_value(manifest)?;
        self.deployments_api()
            .create(&PostParams::default(), &dep)
            .await
            .map_err(|e| OrchestratorError::DeployFailed(format!("{name}: {e}")))?;
        debug!("created deployment {name}");
        Ok(())
    }

    fn pod_status_of(pod: &Pod) -> PodStatus {
        if pod.metadata.deletion_timestamp.is_some() {
            return PodStatus::Terminating;
        }
        let state = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|cs| cs.first())
            .and_then(|c| c.state.as_ref());
        match state {
            Some(state) if state.running.is_some() => PodStatus::Running,
            Some(state) if state.terminated.is_some() => PodStatus::Terminating,
            _ => PodStatus::Pending,
        }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn deploy_nf(&self, spec: &NfPodSpec) -> Result<String, OrchestratorError> {
        let (name, manifest) = render_nf_deployment(spec);
        self.create(&name, manifest).await?;
        Ok(name)
    }

    async fn deploy_sched(&self, node: &str) -> Result<String, OrchestratorError> {
        let (name, manifest) = render_sched_deployment(node);
        self.create(&name, manifest).await?;
        Ok(name)
    }

    async fn delete(&self, name: &str) -> Result<(), OrchestratorError> {
        self.deployments_api()
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| OrchestratorError::DeleteFailed(format!("{name}: {e}")))?;
        debug!("deleted deployment {name}");
        Ok(())
    }

    async fn pod_status(&self, name: &str) -> PodStatus {
        let selector = format!("app={name}");
        let pods = match self
            .pods_api()
            .list(&ListParams::default().labels(&selector))
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!("pod status poll for {name} failed: {e}");
                return PodStatus::NotExist;
            }
        };
        match pods.items.first() {
            Some(pod) => Self::pod_status_of(pod),
            None => PodStatus::NotExist,
        }
    }

    async fn pods(&self) -> Result<Vec<PodInfo>, OrchestratorError> {
        let pods = self.pods_api().list(&ListParams::default()).await?;
        Ok(pods
            .items
            .iter()
            .map(|pod| PodInfo {
                name: pod.metadata.name.clone().unwrap_or_default(),
                node: pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.clone())
                    .unwrap_or_default(),
                status: Self::pod_status_of(pod).to_string(),
            })
            .collect())
    }

    async fn deployments(&self) -> Result<Vec<String>, OrchestratorError> {
        let deps = self.deployments_api().list(&ListParams::default()).await?;
        Ok(deps
            .items
            .into_iter()
            .filter_map(|d| d.metadata.name)
            .collect())
    }

    async fn nodes(&self) -> Result<Vec<String>, OrchestratorError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().filter_map(|n| n.metadata.name).collect())
    }
}
