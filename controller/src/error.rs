// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use thiserror::Error;

use crate::dag::DagError;
use faas_kube::OrchestratorError;
use faas_rpc::RpcError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("worker '{0}' not found")]
    WorkerNotFound(String),

    #[error("sgroup {sgroup} not found on worker '{worker}'")]
    SGroupNotFound { worker: String, sgroup: usize },

    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("instance {port} not found on worker '{worker}'")]
    InstanceNotFound { worker: String, port: u16 },

    #[error("flow matches no active deployment")]
    UnknownFlow,

    #[error("no sgroup resources available")]
    NoResources,

    #[error("worker '{0}' has no spare instance ports")]
    PortsExhausted(String),

    #[error("worker has already shut down")]
    WorkerGone,

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("shutdown completed with errors: {0}")]
    Shutdown(String),
}
