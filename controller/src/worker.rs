// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-node control: the free-SGroup factory, the deployed and free group
//! pools, core accounting and the packing-scheduler loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use faas_config::params::Tunables;
use faas_config::{NodeSpec, nic, profile};
use faas_kube::{NfPodSpec, Orchestrator, PodStatus, await_status};
use faas_rpc::{ChainScheduler, NfCtl};

use crate::background::{WorkerOp, free_sgroup_factory, scheduler_loop};
use crate::core::Core;
use crate::dag::Dag;
use crate::error::Error;
use crate::instance::Instance;
use crate::pool::{IndexPool, StartupPool};
use crate::sgroup::SGroup;

use faas_config::params::{INSTANCE_PORT_BASE, INSTANCE_PORT_COUNT};

#[derive(Default)]
pub(crate) struct SgSets {
    pub sgroups: Vec<Arc<SGroup>>,
    pub free: Vec<Arc<SGroup>>,
}

/// One worker node. The two long-running loops (free-SGroup factory and
/// packing scheduler) are spawned at launch and joined by [`Worker::close`].
pub struct Worker {
    /// Self-handle for spawning tasks and downgrading into groups.
    self_ref: Weak<Worker>,
    name: String,
    ip: String,
    switch_port: u32,
    core_offset: u32,
    core_count: usize,
    pcie: Vec<String>,
    tunables: Tunables,

    port_pool: IndexPool,
    pcie_pool: IndexPool,
    cores: StdMutex<BTreeMap<u32, Core>>,
    /// Deployed and free group pools; the packing pass freezes the worker
    /// by holding this for a full pass.
    sgs: Mutex<SgSets>,
    startup_pool: StartupPool,
    /// Instance host port to owning group, for the telemetry fast path.
    locator: StdMutex<HashMap<u16, Arc<SGroup>>>,

    op_tx: mpsc::Sender<WorkerOp>,
    sched_tx: mpsc::Sender<WorkerOp>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sched_pod: StdMutex<Option<String>>,
    closed: AtomicBool,

    sched: Arc<dyn ChainScheduler>,
    nfctl: Arc<dyn NfCtl>,
    orch: Arc<dyn Orchestrator>,
}

impl Worker {
    /// Build the worker and start its background loops and scheduler agent.
    pub(crate) async fn launch(
        spec: &NodeSpec,
        tunables: Tunables,
        orch: Arc<dyn Orchestrator>,
        nfctl: Arc<dyn NfCtl>,
        sched: Arc<dyn ChainScheduler>,
    ) -> Arc<Worker> {
        let pcie = if spec.pcie.is_empty() {
            nic::DEFAULT_PCIE.iter().map(|s| s.to_string()).collect()
        } else {
            spec.pcie.clone()
        };

        // The lowest core runs the cooperative scheduler agent itself; the
        // next one is the startup core for freshly ready chains.
        let core_offset = 1;
        let core_count = spec.cpu.saturating_sub(1).max(1) as usize;
        let cores = (core_offset..core_offset + core_count as u32)
            .map(|id| (id, Core::new(id)))
            .collect();

        let (op_tx, op_rx) = mpsc::channel(2 * pcie.len().max(1));
        let (sched_tx, sched_rx) = mpsc::channel(4);

        let worker = Arc::new_cyclic(|self_ref| Worker {
            self_ref: self_ref.clone(),
            name: spec.node_name.clone(),
            ip: spec.ip.clone(),
            switch_port: spec.switch_port,
            core_offset,
            core_count,
            port_pool: IndexPool::new(
                format!("{}/ports", spec.node_name),
                INSTANCE_PORT_BASE,
                INSTANCE_PORT_COUNT,
            ),
            pcie_pool: IndexPool::new(format!("{}/pcie", spec.node_name), 0, pcie.len() as u32),
            pcie,
            tunables,
            cores: StdMutex::new(cores),
            sgs: Mutex::new(SgSets::default()),
            startup_pool: StartupPool::new(),
            locator: StdMutex::new(HashMap::new()),
            op_tx,
            sched_tx,
            tasks: Mutex::new(Vec::new()),
            sched_pod: StdMutex::new(None),
            closed: AtomicBool::new(false),
            sched,
            nfctl,
            orch,
        });

        let mut tasks = worker.tasks.lock().await;
        tasks.push(tokio::spawn(free_sgroup_factory(worker.clone(), op_rx)));
        tasks.push(tokio::spawn(scheduler_loop(worker.clone(), sched_rx)));
        tasks.push(tokio::spawn(deploy_sched_agent(worker.clone())));
        drop(tasks);

        info!(
            "worker '{}' up: {} cores [{}..{}), {} VFs, switch port {}",
            worker.name,
            worker.core_count,
            worker.core_offset,
            worker.core_offset + worker.core_count as u32,
            worker.pcie.len(),
            worker.switch_port
        );
        worker
    }

    /// Owning handle to this worker. `&self` can only come from a live
    /// `Arc`, so the upgrade always succeeds.
    fn arc(&self) -> Arc<Worker> {
        self.self_ref.upgrade().expect("worker arc still alive")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn switch_port(&self) -> u32 {
        self.switch_port
    }

    /// The reserved cold core where freshly ready chains wait for traffic.
    pub fn startup_core(&self) -> u32 {
        self.core_offset
    }

    pub(crate) fn core_offset(&self) -> u32 {
        self.core_offset
    }

    pub(crate) fn core_count(&self) -> usize {
        self.core_count
    }

    pub(crate) fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub(crate) fn sched(&self) -> &dyn ChainScheduler {
        self.sched.as_ref()
    }

    pub(crate) fn nfctl(&self) -> &dyn NfCtl {
        self.nfctl.as_ref()
    }

    pub(crate) fn orch(&self) -> &dyn Orchestrator {
        self.orch.as_ref()
    }

    pub(crate) fn startup_pool(&self) -> &StartupPool {
        &self.startup_pool
    }

    pub(crate) fn sgs(&self) -> &Mutex<SgSets> {
        &self.sgs
    }

    /// Queue `count` free-SGroup creations on the factory.
    pub async fn request_free_sgroups(&self, count: usize) {
        for _ in 0..count {
            if self.op_tx.send(WorkerOp::CreateFreeSGroup).await.is_err() {
                warn!("worker '{}': factory is gone", self.name);
                return;
            }
        }
    }

    /// Warm the whole VF pool at startup.
    pub async fn create_all_free_sgroups(&self) {
        self.request_free_sgroups(self.pcie_pool.len()).await;
    }

    /// Create one free group: reserve a VF, deploy its manager (the primary
    /// container owning the NIC queue), wait for the pod and publish the
    /// group in the free pool.
    pub(crate) async fn create_free_sgroup(&self) -> Option<Arc<SGroup>> {
        let pcie_idx = match self.pcie_pool.take() {
            Some(idx) => idx,
            None => {
                debug!("worker '{}': VF pool exhausted", self.name);
                return None;
            }
        };
        let pcie = self.pcie[pcie_idx as usize].clone();

        let Some(port) = self.port_pool.take() else {
            self.pcie_pool.free(pcie_idx);
            warn!("worker '{}': no spare instance ports", self.name);
            return None;
        };
        let port = port as u16;

        let spec = NfPodSpec {
            node: self.name.clone(),
            func_types: vec!["primary".to_string()],
            host_port: port,
            pcie: pcie.clone(),
            core: self.startup_core(),
            is_primary: true,
            is_ingress: false,
            is_egress: false,
            vport_in: 0,
            vport_out: 0,
        };
        let pod = match self.orch.deploy_nf(&spec).await {
            Ok(pod) => pod,
            Err(e) => {
                error!("worker '{}': manager deploy failed: {e}", self.name);
                self.port_pool.free(u32::from(port));
                self.pcie_pool.free(pcie_idx);
                return None;
            }
        };

        if !await_status(self.orch.as_ref(), &pod, PodStatus::Running).await {
            warn!("worker '{}': manager pod {pod} still not running", self.name);
        }

        let manager = Instance::new(
            "primary",
            port,
            format!("{}:{}", self.ip, port),
            pod,
            0,
            true,
            false,
            false,
        );
        let sg = Arc::new(SGroup::new(
            pcie_idx as usize,
            pcie,
            self.self_ref.clone(),
            manager,
        ));

        let mut sets = self.sgs.lock().await;
        sets.free.push(sg.clone());
        info!(
            "worker '{}': free sgroup {} ready ({} free)",
            self.name,
            sg.id(),
            sets.free.len()
        );
        Some(sg)
    }

    /// Pop a free group, transferring ownership to the caller.
    pub async fn get_free_sgroup(&self) -> Option<Arc<SGroup>> {
        let mut sets = self.sgs.lock().await;
        sets.free.pop()
    }

    pub async fn sgroups(&self) -> Vec<Arc<SGroup>> {
        self.sgs.lock().await.sgroups.clone()
    }

    pub async fn free_sgroup_count(&self) -> usize {
        self.sgs.lock().await.free.len()
    }

    pub async fn find_sgroup(&self, id: usize) -> Option<Arc<SGroup>> {
        let sets = self.sgs.lock().await;
        sets.sgroups.iter().find(|sg| sg.id() == id).cloned()
    }

    /// Groups still under construction, for the activation throttle.
    pub(crate) fn pending_startup(&self) -> usize {
        self.startup_pool.pending_groups()
    }

    /// Deploy one NF container and record it as an instance.
    #[allow(clippy::too_many_arguments)]
    async fn create_instance(
        &self,
        func_types: Vec<String>,
        profiled_cycles: u32,
        pcie: &str,
        core: u32,
        is_ingress: bool,
        is_egress: bool,
        vport_in: u32,
        vport_out: u32,
    ) -> Result<Instance, Error> {
        let Some(port) = self.port_pool.take() else {
            return Err(Error::PortsExhausted(self.name.clone()));
        };
        let port = port as u16;

        let spec = NfPodSpec {
            node: self.name.clone(),
            func_types: func_types.clone(),
            host_port: port,
            pcie: pcie.to_string(),
            core,
            is_primary: false,
            is_ingress,
            is_egress,
            vport_in,
            vport_out,
        };
        match self.orch.deploy_nf(&spec).await {
            Ok(pod) => Ok(Instance::new(
                func_types.join(","),
                port,
                format!("{}:{}", self.ip, port),
                pod,
                profiled_cycles,
                false,
                is_ingress,
                is_egress,
            )),
            Err(e) => {
                self.port_pool.free(u32::from(port));
                Err(e.into())
            }
        }
    }

    /// Materialize an NF chain on a free group, one container per position.
    /// A deploy failure rolls back the created instances and returns the
    /// group to the free pool.
    pub(crate) async fn create_sgroup(
        &self,
        sg: &Arc<SGroup>,
        chain: &[String],
        owner: Option<(String, Arc<Dag>)>,
    ) {
        if chain.is_empty() {
            warn!("worker '{}': refusing to build an empty chain", self.name);
            self.file_free_sgroup(sg).await;
            return;
        }

        for (i, func_type) in chain.iter().enumerate() {
            let is_ingress = i == 0;
            let is_egress = i + 1 == chain.len();
            let created = self
                .create_instance(
                    vec![func_type.clone()],
                    profile::cycle_cost(func_type),
                    sg.pcie(),
                    self.startup_core(),
                    is_ingress,
                    is_egress,
                    i as u32,
                    (i + 1) as u32,
                )
                .await;
            match created {
                Ok(instance) => {
                    let port = instance.port;
                    sg.append_instance(instance).await;
                    self.startup_pool.add(port, sg.clone());
                    self.locator
                        .lock()
                        .expect("locator lock poisoned")
                        .insert(port, sg.clone());
                }
                Err(e) => {
                    error!(
                        "worker '{}': deploy of '{func_type}' failed, rolling back sgroup {}: {e}",
                        self.name,
                        sg.id()
                    );
                    self.destroy_sgroup(sg).await;
                    return;
                }
            }
        }

        {
            let mut sets = self.sgs.lock().await;
            sets.sgroups.push(sg.clone());
        }
        if let Some((user, dag)) = owner {
            sg.bind_dag(&user, &dag).await;
            dag.add_sgroup(sg.clone());
        }
        sg.mark_complete().await;
    }

    /// Tear an active group down to its free state and re-file it.
    pub(crate) async fn destroy_sgroup(&self, sg: &Arc<SGroup>) {
        for e in sg.reset().await {
            warn!("worker '{}': sgroup {} teardown: {e}", self.name, sg.id());
        }
        self.file_free_sgroup(sg).await;
    }

    /// Return a group taken with [`Worker::get_free_sgroup`] unused.
    pub(crate) async fn put_back_free_sgroup(&self, sg: &Arc<SGroup>) {
        self.file_free_sgroup(sg).await;
    }

    /// Deploy a whole chain as one consolidated container (Metron mode).
    pub(crate) async fn metron_deploy_consolidated(
        &self,
        sg: &Arc<SGroup>,
        func_types: Vec<String>,
        profiled_cycles: u32,
        core: u32,
    ) -> Result<(), Error> {
        let instance = self
            .create_instance(func_types, profiled_cycles, sg.pcie(), core, true, true, 0, 1)
            .await?;
        let port = instance.port;
        sg.append_instance(instance).await;
        self.startup_pool.add(port, sg.clone());
        self.locator
            .lock()
            .expect("locator lock poisoned")
            .insert(port, sg.clone());
        Ok(())
    }

    async fn file_free_sgroup(&self, sg: &Arc<SGroup>) {
        let mut sets = self.sgs.lock().await;
        sets.sgroups.retain(|s| s.id() != sg.id());
        if !sets.free.iter().any(|s| s.id() == sg.id()) {
            sets.free.push(sg.clone());
        }
    }

    /// Fully dispose of a free group: delete its manager pod and release
    /// the VF and port.
    pub(crate) async fn destroy_free_sgroup(&self, sg: &Arc<SGroup>) -> Result<(), Error> {
        let (pod, port) = sg.manager_info().await;
        self.orch.delete(&pod).await?;
        if !await_status(self.orch.as_ref(), &pod, PodStatus::NotExist).await {
            warn!("worker '{}': manager pod {pod} still terminating", self.name);
        }
        self.port_pool.free(u32::from(port));
        self.pcie_pool.free(sg.id() as u32);
        Ok(())
    }

    /// Resolve a live instance port to its owning group.
    pub fn locate_instance(&self, port: u16) -> Option<Arc<SGroup>> {
        self.locator
            .lock()
            .expect("locator lock poisoned")
            .get(&port)
            .cloned()
    }

    /// Release the per-worker resources of a destroyed instance.
    pub(crate) async fn release_instance(&self, port: u16) {
        let addr = format!("{}:{}", self.ip, port);
        self.nfctl.forget(&addr).await;
        self.locator
            .lock()
            .expect("locator lock poisoned")
            .remove(&port);
        self.startup_pool.remove(port);
        self.port_pool.free(u32::from(port));
    }

    /// Move a group's core membership from `old` to `new`.
    pub(crate) fn core_attach(&self, sg: usize, old: Option<u32>, new: u32) {
        let mut cores = self.cores.lock().expect("cores lock poisoned");
        if let Some(old) = old {
            if let Some(core) = cores.get_mut(&old) {
                core.remove(sg);
            }
        }
        if let Some(core) = cores.get_mut(&new) {
            core.add(sg);
        } else {
            warn!("worker '{}': core {new} is outside the managed range", self.name);
        }
    }

    /// Drop a group from its core's set.
    pub(crate) fn core_detach(&self, sg: usize, core: Option<u32>) {
        let mut cores = self.cores.lock().expect("cores lock poisoned");
        if let Some(core) = core.and_then(|id| cores.get_mut(&id)) {
            core.remove(sg);
        }
    }

    /// An empty core outside the startup reservation, if any.
    pub(crate) fn pick_idle_core(&self) -> Option<u32> {
        let cores = self.cores.lock().expect("cores lock poisoned");
        cores
            .values()
            .find(|c| c.id != self.startup_core() && c.is_empty())
            .map(|c| c.id)
    }

    pub(crate) fn core_members(&self, core: u32) -> Vec<usize> {
        let cores = self.cores.lock().expect("cores lock poisoned");
        cores.get(&core).map(|c| c.sgroups()).unwrap_or_default()
    }

    /// Aggregate packet load over the worker's active groups.
    pub(crate) async fn total_pkt_load(&self) -> f64 {
        let sets = self.sgs.lock().await;
        let mut total = 0.0;
        for sg in &sets.sgroups {
            let snap = sg.snapshot().await;
            if snap.active {
                total += snap.pkt_load;
            }
        }
        total
    }

    /// (active core count, total rate) for the telemetry logger.
    pub(crate) async fn load_summary(&self) -> (u64, f64) {
        let sets = self.sgs.lock().await;
        let mut cores: Vec<u32> = Vec::new();
        let mut kpps = 0.0;
        for sg in &sets.sgroups {
            let snap = sg.snapshot().await;
            if snap.active && snap.sched {
                if let Some(core) = snap.core_id {
                    if !cores.contains(&core) {
                        cores.push(core);
                    }
                }
                kpps += snap.rate_kpps;
            }
        }
        (cores.len() as u64, kpps)
    }

    /// Stop both loops, kill the scheduler agent, delete every pod and
    /// release every resource. Errors are collected and joined rather than
    /// aborting the teardown halfway.
    pub async fn close(&self) -> Result<(), Error> {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        let mut errors: Vec<String> = Vec::new();

        if first {
            let _ = self.op_tx.send(WorkerOp::Shutdown).await;
            let _ = self.sched_tx.send(WorkerOp::Shutdown).await;
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().await;
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                errors.push(format!("background task: {e}"));
            }
        }

        if first {
            if let Err(e) = self.sched.kill_sched().await {
                errors.push(format!("kill scheduler agent: {e}"));
            }
        }
        let sched_pod = self
            .sched_pod
            .lock()
            .expect("sched pod lock poisoned")
            .take();
        if let Some(pod) = sched_pod {
            if let Err(e) = self.orch.delete(&pod).await {
                errors.push(format!("delete {pod}: {e}"));
            }
        }

        let (deployed, free) = {
            let mut sets = self.sgs.lock().await;
            (
                std::mem::take(&mut sets.sgroups),
                std::mem::take(&mut sets.free),
            )
        };

        let mut teardown: JoinSet<Vec<String>> = JoinSet::new();
        for sg in deployed {
            let worker = self.arc();
            teardown.spawn(async move {
                let mut errs = sg.reset().await;
                if let Err(e) = worker.destroy_free_sgroup(&sg).await {
                    errs.push(e.to_string());
                }
                errs
            });
        }
        for sg in free {
            let worker = self.arc();
            teardown.spawn(async move {
                match worker.destroy_free_sgroup(&sg).await {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![e.to_string()],
                }
            });
        }
        while let Some(joined) = teardown.join_next().await {
            match joined {
                Ok(errs) => errors.extend(errs),
                Err(e) => errors.push(format!("teardown task: {e}")),
            }
        }

        info!("worker '{}' closed", self.name);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(errors.join("; ")))
        }
    }

    pub async fn describe(&self) -> String {
        let mut out = format!(
            "worker '{}' at {} (switch port {})\n",
            self.name, self.ip, self.switch_port
        );
        let core_lines: Vec<String> = {
            let cores = self.cores.lock().expect("cores lock poisoned");
            cores.values().map(|c| format!("  {c}")).collect()
        };
        for line in core_lines {
            out.push_str(&line);
            out.push('\n');
        }
        let sets = self.sgs.lock().await;
        out.push_str(&format!("  free sgroups: {}\n", sets.free.len()));
        for sg in &sets.sgroups {
            out.push_str(&format!("  {}\n", sg.describe().await));
        }
        out
    }
}

/// Bring up the cooperative scheduler agent pod for `worker`.
async fn deploy_sched_agent(worker: Arc<Worker>) {
    match worker.orch.deploy_sched(&worker.name).await {
        Ok(pod) => {
            if !await_status(worker.orch.as_ref(), &pod, PodStatus::Running).await {
                warn!("worker '{}': scheduler pod {pod} not running yet", worker.name);
            }
            *worker
                .sched_pod
                .lock()
                .expect("sched pod lock poisoned") = Some(pod);
        }
        Err(e) => error!(
            "worker '{}': scheduler agent deploy failed: {e}",
            worker.name
        ),
    }
}
