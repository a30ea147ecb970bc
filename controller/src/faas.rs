// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The controller façade: owns the workers and the per-user DAGs and
//! exposes every operator- and RPC-facing operation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

use faas_config::params::{
    ControllerMode, MAX_STARTUP_SGROUPS_PER_WORKER, OFCTL_REDIS_PORT, STARTUP_THROTTLE_PAUSE,
    Tunables,
};
use faas_config::{ClusterSpec, NodeSpec};
use faas_kube::Orchestrator;
use faas_rpc::{ChainScheduler, NfCtl, OfctlClient};

use crate::dag::Dag;
use crate::error::Error;
use crate::flowlet::Flowlet;
use crate::sgroup::SGroup;
use crate::worker::Worker;

/// External collaborators injected at construction. Production wires the
/// Kubernetes client and the TCP agents; tests substitute fakes.
pub struct Seams {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub nfctl: Arc<dyn NfCtl>,
    pub sched_factory: Box<dyn Fn(&NodeSpec) -> Arc<dyn ChainScheduler> + Send + Sync>,
}

pub struct FaasController {
    self_ref: Weak<FaasController>,
    workers: BTreeMap<String, Arc<Worker>>,
    dags: StdMutex<BTreeMap<String, Arc<Dag>>>,
    tunables: Tunables,
    master_ip: String,
    ofctl: Option<OfctlClient>,
    orch: Arc<dyn Orchestrator>,
}

impl FaasController {
    /// Build the controller, launch every worker's loops and warm the free
    /// group pools.
    pub async fn launch(cluster: &ClusterSpec, tunables: Tunables, seams: Seams) -> Arc<Self> {
        let mut workers = BTreeMap::new();
        for spec in &cluster.workers {
            if workers.contains_key(&spec.node_name) {
                warn!("duplicate worker '{}' in topology; keeping the first", spec.node_name);
                continue;
            }
            let sched = (seams.sched_factory)(spec);
            let worker = Worker::launch(
                spec,
                tunables,
                seams.orchestrator.clone(),
                seams.nfctl.clone(),
                sched,
            )
            .await;
            workers.insert(spec.node_name.clone(), worker);
        }

        let ofctl = if tunables.mode == ControllerMode::Metron && !cluster.ofctl.ip.is_empty() {
            let addr = format!("{}:{}", cluster.ofctl.ip, OFCTL_REDIS_PORT);
            match OfctlClient::connect(&addr, &cluster.ofctl.password).await {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!("ofctl unavailable at {addr}: {e}");
                    None
                }
            }
        } else {
            None
        };

        let controller = Arc::new_cyclic(|self_ref| FaasController {
            self_ref: self_ref.clone(),
            workers,
            dags: StdMutex::new(BTreeMap::new()),
            tunables,
            master_ip: cluster.master.ip.clone(),
            ofctl,
            orch: seams.orchestrator,
        });

        for worker in controller.workers.values() {
            match tunables.warm_free_sgroups {
                Some(count) => worker.request_free_sgroups(count).await,
                None => worker.create_all_free_sgroups().await,
            }
        }
        info!("controller up with {} workers", controller.workers.len());
        controller
    }

    /// Owning handle to the controller. `&self` can only come from a live
    /// `Arc`, so the upgrade always succeeds.
    pub(crate) fn arc(&self) -> Arc<FaasController> {
        self.self_ref.upgrade().expect("controller arc still alive")
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn master_ip(&self) -> &str {
        &self.master_ip
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orch
    }

    pub(crate) fn ofctl(&self) -> Option<&OfctlClient> {
        self.ofctl.as_ref()
    }

    pub fn worker(&self, node: &str) -> Result<&Arc<Worker>, Error> {
        self.workers
            .get(node)
            .ok_or_else(|| Error::WorkerNotFound(node.to_string()))
    }

    pub(crate) fn workers(&self) -> &BTreeMap<String, Arc<Worker>> {
        &self.workers
    }

    /// The DAG owned by `user`, if any.
    pub fn dag(&self, user: &str) -> Result<Arc<Dag>, Error> {
        self.dags
            .lock()
            .expect("dags lock poisoned")
            .get(user)
            .cloned()
            .ok_or_else(|| Error::UserNotFound(user.to_string()))
    }

    pub(crate) fn dags(&self) -> Vec<Arc<Dag>> {
        self.dags
            .lock()
            .expect("dags lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Add an NF to `user`'s DAG, creating the DAG on first use.
    pub fn add_nf(&self, user: &str, func_type: &str) -> usize {
        let dag = {
            let mut dags = self.dags.lock().expect("dags lock poisoned");
            dags.entry(user.to_string())
                .or_insert_with(|| Arc::new(Dag::new(user)))
                .clone()
        };
        dag.add_nf(func_type)
    }

    pub fn connect_nfs(&self, user: &str, up: usize, down: usize) -> Result<(), Error> {
        Ok(self.dag(user)?.connect_nfs(up, down)?)
    }

    pub fn add_flow(
        &self,
        user: &str,
        src_ip: &str,
        dst_ip: &str,
        src_port: u32,
        dst_port: u32,
        proto: u32,
    ) -> Result<(), Error> {
        self.dag(user)?.add_flowlet(Flowlet {
            src_ip: src_ip.to_string(),
            dst_ip: dst_ip.to_string(),
            src_port,
            dst_port,
            proto,
        });
        Ok(())
    }

    /// Activate `user`'s DAG and start building serving chains. In FaaS
    /// mode every worker drains its free groups in the background, bounded
    /// by the per-worker startup throttle; Metron mode brings up its fixed
    /// startup allotment and announces it to the switch controller.
    pub async fn activate_dag(&self, user: &str) -> Result<Vec<String>, Error> {
        let dag = self.dag(user)?;
        let chain = dag.activate()?;

        match self.tunables.mode {
            ControllerMode::Faas => {
                for worker in self.workers.values() {
                    let worker = worker.clone();
                    let dag = dag.clone();
                    let chain = chain.clone();
                    let user = user.to_string();
                    tokio::spawn(async move {
                        loop {
                            while worker.pending_startup() >= MAX_STARTUP_SGROUPS_PER_WORKER {
                                sleep(STARTUP_THROTTLE_PAUSE).await;
                            }
                            let Some(sg) = worker.get_free_sgroup().await else {
                                break;
                            };
                            let worker = worker.clone();
                            let dag = dag.clone();
                            let chain = chain.clone();
                            let user = user.clone();
                            tokio::spawn(async move {
                                worker
                                    .create_sgroup(&sg, &chain, Some((user, dag)))
                                    .await;
                            });
                        }
                    });
                }
            }
            ControllerMode::Metron => {
                let controller = self.arc();
                let dag = dag.clone();
                let user = user.to_string();
                tokio::spawn(async move {
                    controller.metron_start_up(&user, &dag).await;
                });
            }
        }
        Ok(chain)
    }

    /// Manually build one chain of `func_types` on `node`, consuming a free
    /// group there. Returns the group id.
    pub async fn create_sgroup(
        &self,
        node: &str,
        func_types: &[String],
    ) -> Result<usize, Error> {
        let worker = self.worker(node)?;
        let sg = worker.get_free_sgroup().await.ok_or(Error::NoResources)?;
        let id = sg.id();
        worker.create_sgroup(&sg, func_types, None).await;
        worker
            .find_sgroup(id)
            .await
            .map(|_| id)
            .ok_or(Error::NoResources)
    }

    pub async fn destroy_sgroup(&self, node: &str, sgroup: usize) -> Result<(), Error> {
        let worker = self.worker(node)?;
        let sg = worker.find_sgroup(sgroup).await.ok_or(Error::SGroupNotFound {
            worker: node.to_string(),
            sgroup,
        })?;
        worker.destroy_sgroup(&sg).await;
        Ok(())
    }

    pub async fn attach_sgroup(&self, node: &str, sgroup: usize, core: u32) -> Result<(), Error> {
        self.sgroup(node, sgroup).await?.attach(core).await
    }

    pub async fn detach_sgroup(&self, node: &str, sgroup: usize) -> Result<(), Error> {
        self.sgroup(node, sgroup).await?.detach().await
    }

    async fn sgroup(&self, node: &str, sgroup: usize) -> Result<Arc<SGroup>, Error> {
        let worker = self.worker(node)?;
        worker.find_sgroup(sgroup).await.ok_or(Error::SGroupNotFound {
            worker: node.to_string(),
            sgroup,
        })
    }

    /// Thread-id callback from a starting instance.
    pub async fn instance_set_up(&self, node: &str, port: u16, tid: i32) -> Result<(), Error> {
        let worker = self.worker(node)?;
        let sg = worker
            .startup_pool()
            .get(port)
            .ok_or(Error::InstanceNotFound {
                worker: node.to_string(),
                port,
            })?;
        sg.instance_set_up(port, tid).await
    }

    /// Telemetry push from a running instance.
    pub async fn instance_update_stats(
        &self,
        node: &str,
        port: u16,
        queue_length: u32,
        rate_kpps: f64,
        cycles_per_packet: u32,
    ) -> Result<(), Error> {
        let worker = self.worker(node)?;
        let sg = worker.locate_instance(port).ok_or(Error::InstanceNotFound {
            worker: node.to_string(),
            port,
        })?;
        sg.update_traffic(port, queue_length, rate_kpps, cycles_per_packet)
            .await
    }

    pub async fn set_cycles(&self, node: &str, port: u16, cycles: u32) -> Result<(), Error> {
        let worker = self.worker(node)?;
        let sg = worker.locate_instance(port).ok_or(Error::InstanceNotFound {
            worker: node.to_string(),
            port,
        })?;
        let addr = sg
            .instance_address(port)
            .await
            .ok_or(Error::InstanceNotFound {
                worker: node.to_string(),
                port,
            })?;
        Ok(worker.nfctl().set_cycles(&addr, cycles).await?)
    }

    pub async fn set_batch(
        &self,
        node: &str,
        port: u16,
        batch_size: u32,
        batch_count: u32,
    ) -> Result<(), Error> {
        let worker = self.worker(node)?;
        let sg = worker.locate_instance(port).ok_or(Error::InstanceNotFound {
            worker: node.to_string(),
            port,
        })?;
        let addr = sg
            .instance_address(port)
            .await
            .ok_or(Error::InstanceNotFound {
                worker: node.to_string(),
                port,
            })?;
        Ok(worker
            .nfctl()
            .set_batch(&addr, batch_size, batch_count)
            .await?)
    }

    /// Shut every worker down, collecting rather than short-circuiting on
    /// errors. Safe to call more than once.
    pub async fn close(&self) -> Result<(), Error> {
        let mut teardown = JoinSet::new();
        for worker in self.workers.values() {
            let worker = worker.clone();
            teardown.spawn(async move { worker.close().await });
        }
        let mut errors = Vec::new();
        while let Some(joined) = teardown.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e.to_string()),
                Err(e) => errors.push(format!("close task: {e}")),
            }
        }
        if errors.is_empty() {
            info!("controller closed");
            Ok(())
        } else {
            Err(Error::Shutdown(errors.join("; ")))
        }
    }

    /// (active core count, total rate) across the cluster.
    pub(crate) async fn load_summary(&self) -> (u64, f64) {
        let mut cores = 0;
        let mut kpps = 0.0;
        for worker in self.workers.values() {
            let (c, k) = worker.load_summary().await;
            cores += c;
            kpps += k;
        }
        (cores, kpps)
    }

    pub async fn describe_workers(&self) -> String {
        let mut out = String::new();
        for worker in self.workers.values() {
            out.push_str(&worker.describe().await);
        }
        out
    }

    pub async fn describe_worker(&self, node: &str) -> Result<String, Error> {
        Ok(self.worker(node)?.describe().await)
    }

    pub fn describe_dags(&self, user: Option<&str>) -> String {
        let dags = self.dags.lock().expect("dags lock poisoned");
        match user {
            Some(user) => dags
                .get(user)
                .map(|d| d.to_string())
                .unwrap_or_else(|| format!("user '{user}' not found")),
            None => dags.values().map(|d| format!("{d}\n")).collect(),
        }
    }
}
