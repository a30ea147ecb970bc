// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Scheduling groups. An SGroup is one NF chain bound to one NIC queue,
//! scheduled as an atomic run-to-completion unit on a single core.
//!
//! Lifecycle: a free group owns only its manager container and NIC queue.
//! Chain construction appends NF instances; once every instance has
//! reported its thread id the chain is registered with the worker's
//! cooperative scheduler and parked on the startup core. Traffic telemetry
//! flips the group active; sustained silence flips it back idle.

use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use faas_config::params::{
    BATCH_TARGET_UTILIZATION, CONTEXT_SWITCH_CYCLES, CORE_FREQ_KHZ, DEFAULT_BATCH_SIZE,
    MIN_IDLE_SAMPLES, NIC_QUEUE_CAPACITY,
};

use crate::dag::Dag;
use crate::error::Error;
use crate::instance::Instance;
use crate::worker::Worker;

/// Point-in-time view of a group, taken under its lock.
#[derive(Debug, Clone)]
pub struct SgSnapshot {
    pub id: usize,
    pub ready: bool,
    pub active: bool,
    pub sched: bool,
    pub core_id: Option<u32>,
    pub queue_length: u32,
    pub rate_kpps: f64,
    pub max_rate_kpps: f64,
    pub q_load: f64,
    pub pkt_load: f64,
    pub instances: usize,
}

pub(crate) struct SgState {
    pub manager: Instance,
    pub instances: Vec<Instance>,
    /// Captured thread ids, ingress first; filled on the readiness edge.
    pub tids: Vec<i32>,
    /// Chain construction has appended every instance.
    pub complete: bool,
    pub ready: bool,
    pub active: bool,
    pub sched: bool,
    pub core_id: Option<u32>,
    pub batch_size: u32,
    pub batch_count: u32,
    pub sum_cycles: u32,
    pub queue_length: u32,
    pub rate_kpps: f64,
    pub max_rate_kpps: f64,
    pub idle_samples: u32,
    pub user: Option<String>,
    pub dag: Option<Weak<Dag>>,
}

impl SgState {
    fn q_load(&self) -> f64 {
        100.0 * f64::from(self.queue_length) / f64::from(NIC_QUEUE_CAPACITY)
    }

    fn pkt_load(&self) -> f64 {
        if self.max_rate_kpps > 0.0 {
            100.0 * self.rate_kpps / self.max_rate_kpps
        } else {
            0.0
        }
    }

    /// Refresh the estimated maximum packet rate from the chain's current
    /// cycle cost and batching parameters.
    fn refresh_max_rate(&mut self) {
        if self.sum_cycles == 0 || self.batch_count == 0 {
            self.max_rate_kpps = 0.0;
            return;
        }
        let n = self.instances.len() as f64;
        let interrupt_cycles = f64::from(CONTEXT_SWITCH_CYCLES) * (n + 1.0)
            / f64::from(self.batch_size * self.batch_count);
        self.max_rate_kpps = CORE_FREQ_KHZ / (f64::from(self.sum_cycles) + interrupt_cycles);
    }
}

/// The atomic scheduling unit. Identified by its PCIe VF index, which also
/// selects the destination MAC the switch steers flows with.
pub struct SGroup {
    id: usize,
    pcie: String,
    worker: Weak<Worker>,
    state: Mutex<SgState>,
}

impl SGroup {
    pub(crate) fn new(id: usize, pcie: String, worker: Weak<Worker>, manager: Instance) -> Self {
        SGroup {
            id,
            pcie,
            worker,
            state: Mutex::new(SgState {
                manager,
                instances: Vec::new(),
                tids: Vec::new(),
                complete: false,
                ready: false,
                active: false,
                sched: false,
                core_id: None,
                batch_size: DEFAULT_BATCH_SIZE,
                batch_count: 1,
                sum_cycles: 0,
                queue_length: 0,
                rate_kpps: 0.0,
                max_rate_kpps: 0.0,
                idle_samples: 0,
                user: None,
                dag: None,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pcie(&self) -> &str {
        &self.pcie
    }

    pub fn worker(&self) -> Option<Arc<Worker>> {
        self.worker.upgrade()
    }

    pub async fn snapshot(&self) -> SgSnapshot {
        let state = self.state.lock().await;
        SgSnapshot {
            id: self.id,
            ready: state.ready,
            active: state.active,
            sched: state.sched,
            core_id: state.core_id,
            queue_length: state.queue_length,
            rate_kpps: state.rate_kpps,
            max_rate_kpps: state.max_rate_kpps,
            q_load: state.q_load(),
            pkt_load: state.pkt_load(),
            instances: state.instances.len(),
        }
    }

    pub(crate) async fn append_instance(&self, instance: Instance) {
        let mut state = self.state.lock().await;
        state.instances.push(instance);
    }

    /// Chain construction is finished; the group may become ready as soon
    /// as (or if already) every thread id is in.
    pub(crate) async fn mark_complete(&self) {
        let Some(worker) = self.worker.upgrade() else {
            return;
        };
        let mut state = self.state.lock().await;
        state.complete = true;
        self.try_become_ready(&mut state, &worker).await;
    }

    pub async fn instance_ports(&self) -> Vec<u16> {
        let state = self.state.lock().await;
        state.instances.iter().map(|i| i.port).collect()
    }

    pub async fn instance_address(&self, port: u16) -> Option<String> {
        let state = self.state.lock().await;
        state
            .instances
            .iter()
            .find(|i| i.port == port)
            .map(|i| i.address.clone())
    }

    pub(crate) async fn manager_info(&self) -> (String, u16) {
        let state = self.state.lock().await;
        (state.manager.pod_name.clone(), state.manager.port)
    }

    pub(crate) async fn bind_dag(&self, user: &str, dag: &Arc<Dag>) {
        let mut state = self.state.lock().await;
        state.user = Some(user.to_string());
        state.dag = Some(Arc::downgrade(dag));
    }

    pub(crate) async fn owner(&self) -> Option<(String, Arc<Dag>)> {
        let state = self.state.lock().await;
        let user = state.user.clone()?;
        let dag = state.dag.as_ref()?.upgrade()?;
        Some((user, dag))
    }

    /// Record a thread id reported by an instance. On the edge where the
    /// last id arrives, register and park the chain; see the module doc.
    pub async fn instance_set_up(&self, port: u16, tid: i32) -> Result<(), Error> {
        let worker = self.worker.upgrade().ok_or(Error::WorkerGone)?;
        let mut state = self.state.lock().await;

        let Some(instance) = state.instances.iter_mut().find(|i| i.port == port) else {
            return Err(Error::InstanceNotFound {
                worker: worker.name().to_string(),
                port,
            });
        };
        instance.tid = Some(tid);
        debug!("sgroup {}: instance {port} runs as tid {tid}", self.id);
        worker.startup_pool().remove(port);

        self.try_become_ready(&mut state, &worker).await;
        Ok(())
    }

    async fn try_become_ready(&self, state: &mut SgState, worker: &Worker) {
        if state.ready
            || !state.complete
            || state.instances.is_empty()
            || state.instances.iter().any(|i| i.tid.is_none())
        {
            return;
        }

        let tids: Vec<i32> = state.instances.iter().filter_map(|i| i.tid).collect();
        let target = state.core_id.unwrap_or_else(|| worker.startup_core());

        if let Err(e) = worker.sched().setup_chain(&tids).await {
            warn!("sgroup {}: chain setup failed: {e}", self.id);
            return;
        }
        if let Err(e) = worker.sched().attach_chain(&tids, target).await {
            warn!("sgroup {}: chain attach failed: {e}", self.id);
            return;
        }
        worker.core_attach(self.id, state.core_id, target);

        state.tids = tids;
        self.tune_batch(state, worker).await;
        state.sum_cycles = state.instances.iter().map(Instance::cycle_cost).sum();
        state.refresh_max_rate();
        state.ready = true;
        state.sched = true;
        state.core_id = Some(target);
        info!(
            "sgroup {}: ready with {} instances on core {target}",
            self.id,
            state.instances.len()
        );
    }

    /// Size the per-chain batch count so that interrupt overhead stays
    /// within the utilization target, and push the parameters to every
    /// instance.
    async fn tune_batch(&self, state: &mut SgState, worker: &Worker) {
        let sum_profiled: u32 = state.instances.iter().map(|i| i.profiled_cycles).sum();
        if sum_profiled == 0 {
            return;
        }
        let n = state.instances.len() as f64;
        let slack = (1.0 / BATCH_TARGET_UTILIZATION - 1.0)
            * f64::from(sum_profiled)
            * f64::from(state.batch_size);
        let count = (f64::from(CONTEXT_SWITCH_CYCLES) * (n + 1.0) / slack).ceil();
        state.batch_count = (count as u32).max(1);

        for instance in &state.instances {
            if let Err(e) = worker
                .nfctl()
                .set_batch(&instance.address, state.batch_size, state.batch_count)
                .await
            {
                warn!("sgroup {}: set_batch on {} failed: {e}", self.id, instance);
            }
            if instance.func_type == "bypass" {
                if let Err(e) = worker
                    .nfctl()
                    .set_cycles(&instance.address, instance.profiled_cycles)
                    .await
                {
                    warn!("sgroup {}: set_cycles on {} failed: {e}", self.id, instance);
                }
            }
        }
    }

    /// Fold one telemetry report into the group. The ingress instance's
    /// queue and rate stand for the whole group; only an egress report
    /// re-estimates the chain cost and maximum rate.
    pub async fn update_traffic(&self, port: u16, queue_length: u32, rate_kpps: f64, cycles_per_packet: u32) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let Some(instance) = state.instances.iter_mut().find(|i| i.port == port) else {
            let worker = self
                .worker
                .upgrade()
                .map(|w| w.name().to_string())
                .unwrap_or_default();
            return Err(Error::InstanceNotFound { worker, port });
        };
        instance.queue_length = queue_length;
        instance.rate_kpps = rate_kpps;
        instance.cycles_per_packet = cycles_per_packet;
        let (is_ingress, is_egress) = (instance.is_ingress, instance.is_egress);

        if is_ingress {
            state.queue_length = queue_length;
            state.rate_kpps = rate_kpps;
            if queue_length > 0 || rate_kpps > 0.0 {
                state.active = true;
                state.idle_samples = 0;
            } else {
                state.idle_samples += 1;
                if state.idle_samples >= MIN_IDLE_SAMPLES && state.active {
                    debug!("sgroup {}: idle after {} silent samples", self.id, state.idle_samples);
                    state.active = false;
                }
            }
        }
        if is_egress {
            state.sum_cycles = state.instances.iter().map(Instance::cycle_cost).sum();
            state.refresh_max_rate();
        }
        Ok(())
    }

    /// A flow was just steered here; count the group active immediately
    /// rather than waiting for the next telemetry sample.
    pub async fn mark_active(&self) {
        let mut state = self.state.lock().await;
        state.active = true;
        state.idle_samples = 0;
    }

    /// Pin the chain to `core`. No-op when already scheduled there.
    pub async fn attach(&self, core: u32) -> Result<(), Error> {
        let worker = self.worker.upgrade().ok_or(Error::WorkerGone)?;
        let mut state = self.state.lock().await;
        self.attach_locked(&mut state, &worker, core).await
    }

    async fn attach_locked(
        &self,
        state: &mut SgState,
        worker: &Worker,
        core: u32,
    ) -> Result<(), Error> {
        if state.sched && state.core_id == Some(core) {
            return Ok(());
        }
        worker.sched().attach_chain(&state.tids, core).await?;
        worker.core_attach(self.id, state.core_id, core);
        state.core_id = Some(core);
        state.sched = true;
        Ok(())
    }

    /// Stop executing the chain. The last core id is retained.
    pub async fn detach(&self) -> Result<(), Error> {
        let worker = self.worker.upgrade().ok_or(Error::WorkerGone)?;
        let mut state = self.state.lock().await;
        if !state.sched {
            return Ok(());
        }
        worker.sched().detach_chain(&state.tids, 0).await?;
        state.sched = false;
        Ok(())
    }

    /// Pre-assign a core without engaging the scheduler (Metron pins the
    /// chain at creation instead).
    pub(crate) async fn assign_core(&self, core: u32) {
        let Some(worker) = self.worker.upgrade() else {
            return;
        };
        let mut state = self.state.lock().await;
        worker.core_attach(self.id, state.core_id, core);
        state.core_id = Some(core);
    }

    /// Destroy every NF instance and return the group to its free state.
    /// The manager and NIC queue survive; the caller re-files the group in
    /// the worker's free pool. Returns the accumulated teardown errors.
    pub(crate) async fn reset(&self) -> Vec<String> {
        let Some(worker) = self.worker.upgrade() else {
            return vec!["worker has already shut down".to_string()];
        };
        let mut state = self.state.lock().await;
        let mut errors = Vec::new();

        if !state.tids.is_empty() {
            if let Err(e) = worker.sched().remove_chain(&state.tids).await {
                warn!("sgroup {}: remove_chain failed: {e}", self.id);
            }
        }

        let instances: Vec<Instance> = state.instances.drain(..).collect();
        for instance in instances {
            if let Err(e) = worker.orch().delete(&instance.pod_name).await {
                errors.push(format!("delete {}: {e}", instance.pod_name));
            }
            worker.release_instance(instance.port).await;
        }

        worker.core_detach(self.id, state.core_id);
        if let Some(dag) = state.dag.take().and_then(|d| d.upgrade()) {
            dag.remove_sgroup(self.id);
        }
        state.user = None;
        state.tids.clear();
        state.complete = false;
        state.ready = false;
        state.active = false;
        state.sched = false;
        state.core_id = None;
        state.batch_count = 1;
        state.sum_cycles = 0;
        state.queue_length = 0;
        state.rate_kpps = 0.0;
        state.max_rate_kpps = 0.0;
        state.idle_samples = 0;
        errors
    }

    #[cfg(test)]
    pub(crate) async fn tids(&self) -> Vec<i32> {
        self.state.lock().await.tids.clone()
    }

    pub async fn describe(&self) -> String {
        let state = self.state.lock().await;
        let mut out = format!(
            "sgroup {} [{}] ready={} active={} sched={} core={:?} q={} rate={:.1}kpps max={:.1}kpps",
            self.id,
            self.pcie,
            state.ready,
            state.active,
            state.sched,
            state.core_id,
            state.queue_length,
            state.rate_kpps,
            state.max_rate_kpps,
        );
        for instance in &state.instances {
            out.push_str(&format!("\n    {instance} tid={:?}", instance.tid));
        }
        out
    }
}

impl fmt::Debug for SGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SGroup")
            .field("id", &self.id)
            .field("pcie", &self.pcie)
            .finish_non_exhaustive()
    }
}
