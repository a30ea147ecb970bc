// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The two long-running loops of every worker.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

use faas_config::params::{ControllerMode, PackingPolicy, SCHEDULE_INTERVAL};

use crate::worker::Worker;

/// Control messages consumed by the worker loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerOp {
    CreateFreeSGroup,
    Shutdown,
}

/// Waits for control messages and spawns one transient task per free-group
/// creation so NIC queues come up concurrently. Creation concurrency is
/// bounded by the VF pool itself.
pub(crate) async fn free_sgroup_factory(worker: Arc<Worker>, mut rx: mpsc::Receiver<WorkerOp>) {
    debug!("worker '{}': free-sgroup factory running", worker.name());
    while let Some(op) = rx.recv().await {
        match op {
            WorkerOp::CreateFreeSGroup => {
                let worker = worker.clone();
                tokio::spawn(async move {
                    worker.create_free_sgroup().await;
                });
            }
            WorkerOp::Shutdown => break,
        }
    }
    debug!("worker '{}': free-sgroup factory exits", worker.name());
}

/// Runs one packing pass per tick until shutdown. Metron mode pins chains
/// at creation, so the loop stays idle there.
pub(crate) async fn scheduler_loop(worker: Arc<Worker>, mut rx: mpsc::Receiver<WorkerOp>) {
    debug!("worker '{}': scheduler loop running", worker.name());
    let mut tick = interval(SCHEDULE_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            op = rx.recv() => match op {
                Some(WorkerOp::Shutdown) | None => break,
                Some(_) => {}
            },
            _ = tick.tick() => {
                if worker.tunables().mode == ControllerMode::Faas {
                    match worker.tunables().packing {
                        PackingPolicy::BestFit => worker.schedule_once().await,
                        PackingPolicy::NoPacking => worker.schedule_once_no_packing().await,
                    }
                }
            }
        }
    }
    debug!("worker '{}': scheduler loop exits", worker.name());
}
