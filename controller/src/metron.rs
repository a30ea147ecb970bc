// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Metron mode: chains are pinned to an idle core at creation, scale-up is
//! driven by switch port reports, and every routing change is published to
//! the OpenFlow controller.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use faas_config::params::{METRON_STARTUP_SGROUPS, PKT_LOAD_CEILING, POD_POLL_INTERVAL};
use faas_config::{nic, profile};

use crate::dag::Dag;
use crate::faas::FaasController;
use crate::sgroup::SGroup;
use crate::worker::Worker;

const READY_WAIT: Duration = Duration::from_secs(20);

impl FaasController {
    /// Port-change report from the switch: scan the matching workers for
    /// overloaded groups and clone each onto a free group. Returns the
    /// affected group ids immediately; cloning proceeds in the background.
    pub async fn update_port(&self, ports: &[u32]) -> Vec<i32> {
        let mut affected = Vec::new();
        for &port in ports {
            let Some(worker) = self
                .workers()
                .values()
                .find(|w| w.switch_port() == port)
            else {
                warn!("port {port} matches no worker");
                continue;
            };
            for sg in worker.sgroups().await {
                let snap = sg.snapshot().await;
                if snap.ready && snap.pkt_load > PKT_LOAD_CEILING {
                    affected.push(sg.id() as i32);
                    let controller = self.arc();
                    tokio::spawn(async move {
                        controller.metron_scale_up(&sg).await;
                    });
                }
            }
        }
        affected
    }

    /// Bring up the startup allotment of chains for a freshly activated
    /// DAG and announce each to the switch controller.
    pub(crate) async fn metron_start_up(&self, user: &str, dag: &Arc<Dag>) {
        for _ in 0..METRON_STARTUP_SGROUPS {
            let Some(sg) = self.metron_get_free_sgroup().await else {
                error!("metron startup for '{user}': no free sgroups");
                return;
            };
            let Some(worker) = sg.worker() else {
                continue;
            };
            worker
                .metron_create_sgroup(&sg, &dag.chain(), user, dag)
                .await;

            if self.wait_ready(&sg).await {
                self.announce_sgroup(&worker, &sg).await;
            } else {
                warn!("metron startup for '{user}': sgroup {} never became ready", sg.id());
            }
        }
    }

    /// Clone an overloaded group's chain onto a free group and tell the
    /// switch controller to split the traffic class.
    pub(crate) async fn metron_scale_up(&self, overloaded: &Arc<SGroup>) {
        let Some((user, dag)) = overloaded.owner().await else {
            warn!("sgroup {} is overloaded but serves no deployment", overloaded.id());
            return;
        };
        let Some(sg) = self.metron_get_free_sgroup().await else {
            error!("scale-up of sgroup {}: no free sgroups", overloaded.id());
            return;
        };
        let Some(worker) = sg.worker() else {
            return;
        };
        worker
            .metron_create_sgroup(&sg, &dag.chain(), &user, &dag)
            .await;

        if !self.wait_ready(&sg).await {
            warn!("scale-up of sgroup {}: clone never became ready", overloaded.id());
            return;
        }
        if let Some(ofctl) = self.ofctl() {
            let dmac = nic::dst_mac(sg.id()).unwrap_or("none");
            if let Err(e) = ofctl
                .sgroup_up_split(overloaded.id(), sg.id(), worker.switch_port(), dmac)
                .await
            {
                warn!("ofctl split announcement failed: {e}");
            }
        }
        info!("sgroup {} split onto sgroup {}", overloaded.id(), sg.id());
    }

    /// Two-choices pick: probe two random workers and take a free group
    /// from the less loaded one, pre-assigning it an idle core.
    pub(crate) async fn metron_get_free_sgroup(&self) -> Option<Arc<SGroup>> {
        let workers: Vec<&Arc<Worker>> = self.workers().values().collect();
        let chosen: Arc<Worker> = match workers.len() {
            0 => return None,
            1 => workers[0].clone(),
            n => {
                let (first, second) = {
                    let mut rng = rand::thread_rng();
                    let first = rng.gen_range(0..n);
                    let mut second = rng.gen_range(0..n);
                    while second == first {
                        second = rng.gen_range(0..n);
                    }
                    (first, second)
                };
                let (a, b) = (workers[first], workers[second]);
                if a.total_pkt_load().await <= b.total_pkt_load().await {
                    a.clone()
                } else {
                    b.clone()
                }
            }
        };

        let sg = chosen.get_free_sgroup().await?;
        let Some(core) = chosen.pick_idle_core() else {
            warn!("worker '{}' is out of idle cores", chosen.name());
            chosen.put_back_free_sgroup(&sg).await;
            return None;
        };
        sg.assign_core(core).await;
        Some(sg)
    }

    async fn announce_sgroup(&self, worker: &Arc<Worker>, sg: &Arc<SGroup>) {
        if let Some(ofctl) = self.ofctl() {
            let dmac = nic::dst_mac(sg.id()).unwrap_or("none");
            if let Err(e) = ofctl.sgroup_up(sg.id(), worker.switch_port(), dmac).await {
                warn!("ofctl announcement for sgroup {} failed: {e}", sg.id());
            }
        }
    }

    async fn wait_ready(&self, sg: &Arc<SGroup>) -> bool {
        let deadline = Instant::now() + READY_WAIT;
        loop {
            if sg.snapshot().await.ready {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POD_POLL_INTERVAL).await;
        }
    }
}

impl Worker {
    /// Metron deploys the whole chain as one consolidated instance that is
    /// both ingress and egress, pinned to the group's pre-assigned core.
    pub(crate) async fn metron_create_sgroup(
        &self,
        sg: &Arc<SGroup>,
        chain: &[String],
        user: &str,
        dag: &Arc<Dag>,
    ) {
        if chain.is_empty() {
            warn!("worker '{}': refusing to build an empty chain", self.name());
            self.destroy_sgroup(sg).await;
            return;
        }
        let Some(core) = sg.snapshot().await.core_id else {
            warn!(
                "worker '{}': sgroup {} has no core assigned; dropping request",
                self.name(),
                sg.id()
            );
            self.destroy_sgroup(sg).await;
            return;
        };

        let cycles: u32 = chain.iter().map(|ty| profile::cycle_cost(ty)).sum();
        match self
            .metron_deploy_consolidated(sg, chain.to_vec(), cycles, core)
            .await
        {
            Ok(()) => {
                {
                    let mut sets = self.sgs().lock().await;
                    sets.sgroups.push(sg.clone());
                }
                sg.bind_dag(user, dag).await;
                dag.add_sgroup(sg.clone());
                sg.mark_complete().await;
            }
            Err(e) => {
                error!(
                    "worker '{}': consolidated deploy of {:?} failed: {e}",
                    self.name(),
                    chain
                );
                self.destroy_sgroup(sg).await;
            }
        }
    }
}
