// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use faas_config::params::SCHED_AGENT_PORT;
use faas_config::{ClusterSpec, NodeSpec};
use faas_controller::{FaasController, FaasLogger, Seams, server};
use faas_kube::KubeOrchestrator;
use faas_rpc::{ChainScheduler, NfCtlClient, SchedClient};

mod args;
use args::{CmdArgs, Parser};

#[tokio::main]
async fn main() {
    let args = CmdArgs::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .with_target(true)
        .with_thread_ids(true)
        .init();

    if let Err(e) = run(args).await {
        error!("faasd failed: {e}");
        std::process::exit(1);
    }
}

async fn run(args: CmdArgs) -> Result<(), Box<dyn Error>> {
    let cluster = ClusterSpec::load(&args.cluster)?;

    let orchestrator = Arc::new(KubeOrchestrator::connect(&args.namespace).await?);
    let seams = Seams {
        orchestrator,
        nfctl: Arc::new(NfCtlClient::new()),
        sched_factory: Box::new(|spec: &NodeSpec| -> Arc<dyn ChainScheduler> {
            Arc::new(SchedClient::new(format!("{}:{SCHED_AGENT_PORT}", spec.ip)))
        }),
    };
    let controller = FaasController::launch(&cluster, args.tunables(), seams).await;

    let listener = TcpListener::bind(args.listen).await?;
    tokio::spawn(server::serve(controller.clone(), listener));

    let (logger_stop, logger_rx) = mpsc::channel::<()>(1);
    tokio::spawn(FaasLogger::new(controller.clone()).run(logger_rx));

    // The shell owns the foreground; returning from it means the operator
    // quit and the controller is already closed.
    let rt = tokio::runtime::Handle::current();
    let shell_controller = controller.clone();
    tokio::task::spawn_blocking(move || faas_cli::run(shell_controller, rt)).await?;

    drop(logger_stop);
    info!("bye");
    Ok(())
}
