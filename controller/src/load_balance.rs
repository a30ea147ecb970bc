// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-flow dispatch. The ingress switch reports the first packet of every
//! new flow; the controller picks a serving group or scales up from the
//! free pool.

use std::sync::Arc;

use tracing::{debug, info};

use faas_config::nic;
use faas_config::params::{LoadBalanceMode, PKT_LOAD_CEILING, Q_LOAD_CEILING};
use faas_rpc::FlowTableEntry;

use crate::dag::Dag;
use crate::error::Error;
use crate::faas::FaasController;
use crate::flowlet::FiveTuple;
use crate::sgroup::{SGroup, SgSnapshot};
use crate::worker::Worker;

fn entry_for(sg: &SGroup) -> Result<FlowTableEntry, Error> {
    let worker = sg.worker().ok_or(Error::WorkerGone)?;
    let dmac = nic::dst_mac(sg.id()).unwrap_or("none");
    Ok(FlowTableEntry {
        switch_port: worker.switch_port(),
        dmac: dmac.to_string(),
    })
}

impl FaasController {
    /// Route a new flow. Returns the switch port and destination MAC of
    /// the chosen chain; the switch installs the forwarding rule.
    pub async fn update_flow(&self, flow: &FiveTuple) -> Result<FlowTableEntry, Error> {
        let Some(dag) = self.match_dag(flow) else {
            debug!("flow {flow} matches no active deployment");
            return Err(Error::UnknownFlow);
        };

        if let Some(sg) = self.find_available_sgroup(&dag).await {
            sg.mark_active().await;
            return entry_for(&sg);
        }

        // No serving group under the ceiling: scale up onto a free group.
        // The chain builds in the background; early packets wait in the
        // group's NIC queue.
        if let Some((worker, sg)) = self.take_free_sgroup().await {
            let entry = entry_for(&sg)?;
            info!(
                "flow {flow}: scaling up sgroup {} on '{}'",
                sg.id(),
                worker.name()
            );
            let chain = dag.chain();
            let user = dag.user().to_string();
            tokio::spawn(async move {
                worker.create_sgroup(&sg, &chain, Some((user, dag))).await;
            });
            return Ok(entry);
        }

        Err(Error::NoResources)
    }

    fn match_dag(&self, flow: &FiveTuple) -> Option<Arc<Dag>> {
        self.dags()
            .into_iter()
            .find(|dag| dag.matches(flow) && dag.is_active())
    }

    /// Two-pass selection among the DAG's groups. The first pass also
    /// bounds the queue backlog; the second only the packet load.
    async fn find_available_sgroup(&self, dag: &Arc<Dag>) -> Option<Arc<SGroup>> {
        let mut candidates = Vec::new();
        for sg in dag.sgroups() {
            let snap = sg.snapshot().await;
            if snap.ready {
                candidates.push((sg, snap));
            }
        }

        let pick = |snaps: &[(Arc<SGroup>, SgSnapshot)]| -> Option<Arc<SGroup>> {
            let mut best: Option<&(Arc<SGroup>, SgSnapshot)> = None;
            for entry in snaps {
                let better = match best {
                    None => true,
                    Some(current) => match self.tunables().load_balance {
                        LoadBalanceMode::HighLoadFirst => entry.1.rate_kpps > current.1.rate_kpps,
                        LoadBalanceMode::LowLoadFirst => entry.1.rate_kpps < current.1.rate_kpps,
                    },
                };
                if better {
                    best = Some(entry);
                }
            }
            best.map(|(sg, _)| sg.clone())
        };

        let under_both: Vec<(Arc<SGroup>, SgSnapshot)> = candidates
            .iter()
            .filter(|(_, s)| s.q_load <= Q_LOAD_CEILING && s.pkt_load <= PKT_LOAD_CEILING)
            .cloned()
            .collect();
        if let Some(sg) = pick(&under_both) {
            return Some(sg);
        }

        let under_pkt: Vec<(Arc<SGroup>, SgSnapshot)> = candidates
            .into_iter()
            .filter(|(_, s)| s.pkt_load <= PKT_LOAD_CEILING)
            .collect();
        pick(&under_pkt)
    }

    /// First worker with a free group wins.
    pub(crate) async fn take_free_sgroup(&self) -> Option<(Arc<Worker>, Arc<SGroup>)> {
        for worker in self.workers().values() {
            if let Some(sg) = worker.get_free_sgroup().await {
                return Some((worker.clone(), sg));
            }
        }
        None
    }
}
