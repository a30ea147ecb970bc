// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-process fakes for the external seams, so the full group lifecycle
//! runs without a cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;

use faas_config::params::Tunables;
use faas_config::{ClusterSpec, NodeSpec, nic};
use faas_kube::deploy::{render_nf_deployment, render_sched_deployment};
use faas_kube::{NfPodSpec, Orchestrator, OrchestratorError, PodInfo, PodStatus};
use faas_rpc::msg::{PortQueueStats, TcStats};
use faas_rpc::{ChainScheduler, NfCtl, RpcError};

use crate::faas::{FaasController, Seams};

#[derive(Default)]
pub(crate) struct FakeOrchestrator {
    deployments: StdMutex<HashMap<String, PodStatus>>,
    nf_specs: StdMutex<Vec<NfPodSpec>>,
    deploys: AtomicUsize,
    fail_from: AtomicUsize,
}

impl FakeOrchestrator {
    pub(crate) fn new() -> Self {
        let fake = FakeOrchestrator::default();
        fake.fail_from.store(usize::MAX, Ordering::Relaxed);
        fake
    }

    /// Fail every NF deploy from the `n`-th one on (zero-based).
    pub(crate) fn fail_deploys_from(&self, n: usize) {
        self.fail_from.store(n, Ordering::Relaxed);
    }

    pub(crate) fn deployment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .deployments
            .lock()
            .expect("fake orch lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub(crate) fn nf_specs(&self) -> Vec<NfPodSpec> {
        self.nf_specs.lock().expect("fake orch lock").clone()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn deploy_nf(&self, spec: &NfPodSpec) -> Result<String, OrchestratorError> {
        let seq = self.deploys.fetch_add(1, Ordering::Relaxed);
        if seq >= self.fail_from.load(Ordering::Relaxed) {
            return Err(OrchestratorError::DeployFailed("injected failure".into()));
        }
        let (name, _) = render_nf_deployment(spec);
        self.deployments
            .lock()
            .expect("fake orch lock")
            .insert(name.clone(), PodStatus::Running);
        self.nf_specs.lock().expect("fake orch lock").push(spec.clone());
        Ok(name)
    }

    async fn deploy_sched(&self, node: &str) -> Result<String, OrchestratorError> {
        let (name, _) = render_sched_deployment(node);
        self.deployments
            .lock()
            .expect("fake orch lock")
            .insert(name.clone(), PodStatus::Running);
        Ok(name)
    }

    async fn delete(&self, name: &str) -> Result<(), OrchestratorError> {
        self.deployments.lock().expect("fake orch lock").remove(name);
        Ok(())
    }

    async fn pod_status(&self, name: &str) -> PodStatus {
        self.deployments
            .lock()
            .expect("fake orch lock")
            .get(name)
            .copied()
            .unwrap_or(PodStatus::NotExist)
    }

    async fn pods(&self) -> Result<Vec<PodInfo>, OrchestratorError> {
        Ok(self
            .deployments
            .lock()
            .expect("fake orch lock")
            .iter()
            .map(|(name, status)| PodInfo {
                name: name.clone(),
                node: String::new(),
                status: status.to_string(),
            })
            .collect())
    }

    async fn deployments(&self) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.deployment_names())
    }

    async fn nodes(&self) -> Result<Vec<String>, OrchestratorError> {
        Ok(vec!["node1".to_string()])
    }
}

#[derive(Default)]
pub(crate) struct FakeSched {
    calls: StdMutex<Vec<String>>,
    fail: AtomicBool,
}

impl FakeSched {
    pub(crate) fn new() -> Self {
        FakeSched::default()
    }

    pub(crate) fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("fake sched lock").clone()
    }

    pub(crate) fn killed(&self) -> bool {
        self.calls().iter().any(|c| c == "kill")
    }

    fn record(&self, call: String) -> Result<(), RpcError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(RpcError::Status {
                code: 1,
                errmsg: "injected failure".into(),
            });
        }
        self.calls.lock().expect("fake sched lock").push(call);
        Ok(())
    }
}

#[async_trait]
impl ChainScheduler for FakeSched {
    async fn setup_chain(&self, tids: &[i32]) -> Result<(), RpcError> {
        self.record(format!("setup{tids:?}"))
    }

    async fn remove_chain(&self, tids: &[i32]) -> Result<(), RpcError> {
        self.record(format!("remove{tids:?}"))
    }

    async fn attach_chain(&self, tids: &[i32], core: u32) -> Result<(), RpcError> {
        self.record(format!("attach{tids:?}@{core}"))
    }

    async fn detach_chain(&self, tids: &[i32], core: u32) -> Result<(), RpcError> {
        self.record(format!("detach{tids:?}@{core}"))
    }

    async fn kill_sched(&self) -> Result<(), RpcError> {
        self.record("kill".to_string())
    }
}

#[derive(Default)]
pub(crate) struct FakeNfCtl {
    calls: StdMutex<Vec<(String, String)>>,
}

impl FakeNfCtl {
    pub(crate) fn new() -> Self {
        FakeNfCtl::default()
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("fake nfctl lock").clone()
    }

    fn record(&self, addr: &str, call: String) {
        self.calls
            .lock()
            .expect("fake nfctl lock")
            .push((addr.to_string(), call));
    }
}

#[async_trait]
impl NfCtl for FakeNfCtl {
    async fn set_cycles(&self, addr: &str, cycles_per_packet: u32) -> Result<(), RpcError> {
        self.record(addr, format!("set_cycles({cycles_per_packet})"));
        Ok(())
    }

    async fn set_batch(
        &self,
        addr: &str,
        batch_size: u32,
        batch_count: u32,
    ) -> Result<(), RpcError> {
        self.record(addr, format!("set_batch({batch_size},{batch_count})"));
        Ok(())
    }

    async fn tc_stats(&self, addr: &str) -> Result<TcStats, RpcError> {
        self.record(addr, "tc_stats".to_string());
        Ok(TcStats::default())
    }

    async fn port_queue_stats(&self, addr: &str) -> Result<PortQueueStats, RpcError> {
        self.record(addr, "port_queue_stats".to_string());
        Ok(PortQueueStats::default())
    }

    async fn forget(&self, _addr: &str) {}
}

pub(crate) struct Harness {
    pub controller: Arc<FaasController>,
    pub orch: Arc<FakeOrchestrator>,
    pub sched: Arc<FakeSched>,
    pub nfctl: Arc<FakeNfCtl>,
}

pub(crate) fn cluster_spec(workers: usize, vfs: usize, cpu: u32) -> ClusterSpec {
    ClusterSpec {
        master: NodeSpec {
            node_name: "master".into(),
            ip: "10.0.0.1".into(),
            ..Default::default()
        },
        ofctl: NodeSpec::default(),
        workers: (1..=workers)
            .map(|i| NodeSpec {
                node_name: format!("node{i}"),
                ip: format!("10.0.0.{}", 10 + i),
                password: String::new(),
                pcie: nic::DEFAULT_PCIE[..vfs].iter().map(|s| s.to_string()).collect(),
                cpu,
                switch_port: i as u32,
            })
            .collect(),
    }
}

pub(crate) async fn harness(tunables: Tunables, workers: usize, vfs: usize, cpu: u32) -> Harness {
    let orch = Arc::new(FakeOrchestrator::new());
    let sched = Arc::new(FakeSched::new());
    let nfctl = Arc::new(FakeNfCtl::new());

    let shared: Arc<dyn ChainScheduler> = sched.clone();
    let seams = Seams {
        orchestrator: orch.clone(),
        nfctl: nfctl.clone(),
        sched_factory: Box::new(move |_spec: &NodeSpec| shared.clone()),
    };
    let controller = FaasController::launch(&cluster_spec(workers, vfs, cpu), tunables, seams).await;
    Harness {
        controller,
        orch,
        sched,
        nfctl,
    }
}

/// Poll `cond` until it holds, panicking after five seconds.
pub(crate) async fn wait_until<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if cond().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}
