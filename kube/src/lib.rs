// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Container-orchestrator interface. The controller only ever talks to the
//! orchestrator through the [`Orchestrator`] trait; the production
//! implementation drives the Kubernetes API.

pub mod client;
pub mod deploy;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{Instant, sleep};

use faas_config::params::{POD_POLL_INTERVAL, POD_POLL_TIMEOUT};

pub use client::KubeOrchestrator;
pub use deploy::{nf_deployment_name, sched_deployment_name};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("failed to render manifest: {0}")]
    Render(#[from] serde_json::Error),

    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),

    #[error("pod deploy failed: {0}")]
    DeployFailed(String),

    #[error("pod delete failed: {0}")]
    DeleteFailed(String),
}

/// Observable lifecycle states of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodStatus {
    Running,
    Pending,
    Terminating,
    NotExist,
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodStatus::Running => "Running",
            PodStatus::Pending => "Pending",
            PodStatus::Terminating => "Terminating",
            PodStatus::NotExist => "NotExist",
        };
        f.write_str(s)
    }
}

/// Everything needed to deploy one NF container.
#[derive(Debug, Clone)]
pub struct NfPodSpec {
    pub node: String,
    /// Function types run inside the container, ingress first.
    pub func_types: Vec<String>,
    /// Host TCP port of the instance's control server; doubles as the
    /// instance id on its worker.
    pub host_port: u16,
    /// PCIe VF backing the group's NIC queue.
    pub pcie: String,
    pub core: u32,
    /// The primary container initializes the NIC queue and buffers.
    pub is_primary: bool,
    pub is_ingress: bool,
    pub is_egress: bool,
    pub vport_in: u32,
    pub vport_out: u32,
}

/// Summary row for the operator shell.
#[derive(Debug, Clone)]
pub struct PodInfo {
    pub name: String,
    pub node: String,
    pub status: String,
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Deploy one NF container; returns the deployment name.
    async fn deploy_nf(&self, spec: &NfPodSpec) -> Result<String, OrchestratorError>;
    /// Deploy the cooperative scheduler agent on `node`.
    async fn deploy_sched(&self, node: &str) -> Result<String, OrchestratorError>;
    /// Delete a deployment by name.
    async fn delete(&self, name: &str) -> Result<(), OrchestratorError>;
    /// Current status of the pod backing `name`.
    async fn pod_status(&self, name: &str) -> PodStatus;

    async fn pods(&self) -> Result<Vec<PodInfo>, OrchestratorError>;
    async fn deployments(&self) -> Result<Vec<String>, OrchestratorError>;
    async fn nodes(&self) -> Result<Vec<String>, OrchestratorError>;
}

/// Poll until the pod behind `name` reaches `want`. Returns false when the
/// poll window elapses first.
pub async fn await_status(orch: &dyn Orchestrator, name: &str, want: PodStatus) -> bool {
    await_status_for(orch, name, want, POD_POLL_TIMEOUT).await
}

pub async fn await_status_for(
    orch: &dyn Orchestrator,
    name: &str,
    want: PodStatus,
    window: Duration,
) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if orch.pod_status(name).await == want {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POD_POLL_INTERVAL).await;
    }
}
