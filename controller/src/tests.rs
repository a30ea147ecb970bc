// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End-to-end scenarios over the fake seams: activation, dispatch,
//! scale-up, packing and shutdown.

use std::sync::Arc;

use faas_config::nic;
use faas_config::params::{ControllerMode, MIN_IDLE_SAMPLES, Tunables};

use tracing_test::traced_test;

use crate::error::Error;
use crate::flowlet::FiveTuple;
use crate::sgroup::SGroup;
use crate::testutil::{Harness, harness, wait_until};
use crate::worker::Worker;

fn faas_tunables(warm: usize) -> Tunables {
    Tunables {
        warm_free_sgroups: Some(warm),
        ..Tunables::default()
    }
}

fn metron_tunables(warm: usize) -> Tunables {
    Tunables {
        mode: ControllerMode::Metron,
        warm_free_sgroups: Some(warm),
        ..Tunables::default()
    }
}

fn flow(dst_port: u32) -> FiveTuple {
    FiveTuple {
        src_ip: "1.1.1.1".into(),
        dst_ip: "2.2.2.2".into(),
        src_port: 1000,
        dst_port,
        proto: 6,
    }
}

async fn wait_free_sgroups(worker: &Arc<Worker>, count: usize) {
    wait_until("free sgroups", || async move {
        worker.free_sgroup_count().await == count
    })
    .await;
}

/// Report every thread id of `sg`'s instances, driving it ready.
async fn report_tids(h: &Harness, node: &str, sg: &Arc<SGroup>) {
    for (i, port) in sg.instance_ports().await.into_iter().enumerate() {
        h.controller
            .instance_set_up(node, port, 100 + i as i32)
            .await
            .expect("tid callback");
    }
    wait_until("sgroup ready", || async move { sg.snapshot().await.ready }).await;
}

/// S1 setup: one worker, one warmed free group, an activated two-NF DAG
/// whose chain has been built and brought ready.
async fn activated_chain(h: &Harness) -> Arc<SGroup> {
    let c = &h.controller;
    assert_eq!(c.add_nf("u", "vlanpush"), 0);
    assert_eq!(c.add_nf("u", "acl"), 1);
    c.connect_nfs("u", 0, 1).expect("connect");
    c.add_flow("u", "", "", 0, 8080, 0).expect("add flow");
    let chain = c.activate_dag("u").await.expect("activate");
    assert_eq!(chain, vec!["vlanpush".to_string(), "acl".to_string()]);

    let worker = c.worker("node1").expect("worker");
    wait_until("chain construction", || async move {
        let sgs = worker.sgroups().await;
        sgs.len() == 1 && sgs[0].instance_ports().await.len() == 2
    })
    .await;

    let sg = worker.sgroups().await.remove(0);
    report_tids(h, "node1", &sg).await;
    sg
}

#[traced_test]
#[tokio::test]
async fn s1_cold_activation_builds_one_chain() {
    let h = harness(faas_tunables(1), 1, 2, 8).await;
    let worker = h.controller.worker("node1").expect("worker");
    wait_free_sgroups(worker, 1).await;

    let sg = activated_chain(&h).await;
    let snap = sg.snapshot().await;
    assert!(snap.ready);
    assert!(snap.sched);
    assert!(!snap.active);
    assert_eq!(snap.core_id, Some(worker.startup_core()));
    assert_eq!(snap.instances, 2);
    assert_eq!(sg.tids().await.len(), 2);

    // The chain was registered before it was parked, and every instance
    // received its batch parameters.
    let calls = h.sched.calls();
    assert!(calls.iter().any(|c| c.starts_with("setup")), "calls: {calls:?}");
    assert!(calls.iter().any(|c| c.starts_with("attach")), "calls: {calls:?}");
    let batch_pushes = h
        .nfctl
        .calls()
        .iter()
        .filter(|(_, call)| call.starts_with("set_batch"))
        .count();
    assert_eq!(batch_pushes, 2);
}

#[tokio::test]
async fn readiness_edge_failure_leaves_group_unready() {
    let h = harness(metron_tunables(1), 1, 1, 8).await;
    let c = &h.controller;
    let worker = c.worker("node1").expect("worker");
    wait_free_sgroups(worker, 1).await;

    h.sched.fail_calls(true);
    let id = c
        .create_sgroup("node1", &["acl".to_string()])
        .await
        .expect("manual chain");
    let sg = worker.find_sgroup(id).await.expect("deployed");
    let port = sg.instance_ports().await[0];
    c.instance_set_up("node1", port, 7).await.expect("tid callback");

    // The registration RPC failed after bounded retries: no partial
    // attach, the group stays unready for the operator to clean up.
    let snap = sg.snapshot().await;
    assert!(!snap.ready);
    assert!(!snap.sched);
    assert_eq!(snap.core_id, None);

    h.sched.fail_calls(false);
    c.destroy_sgroup("node1", id).await.expect("destroy");
    assert_eq!(worker.free_sgroup_count().await, 1);
}

#[tokio::test]
async fn s2_flow_dispatch_hits_the_ready_chain() {
    let h = harness(faas_tunables(1), 1, 2, 8).await;
    let worker = h.controller.worker("node1").expect("worker");
    wait_free_sgroups(worker, 1).await;
    let sg = activated_chain(&h).await;

    let entry = h.controller.update_flow(&flow(8080)).await.expect("dispatch");
    assert_eq!(entry.switch_port, worker.switch_port());
    assert_eq!(entry.dmac, nic::dst_mac(sg.id()).expect("mac"));
    assert!(sg.snapshot().await.active);
}

#[tokio::test]
async fn s3_unmatched_flow_is_rejected() {
    let h = harness(faas_tunables(1), 1, 2, 8).await;
    let worker = h.controller.worker("node1").expect("worker");
    wait_free_sgroups(worker, 1).await;
    let _sg = activated_chain(&h).await;

    let got = h.controller.update_flow(&flow(22)).await;
    assert!(matches!(got, Err(Error::UnknownFlow)), "got {got:?}");
}

#[tokio::test]
async fn s4_scale_up_on_miss_then_idle() {
    let h = harness(faas_tunables(1), 1, 2, 8).await;
    let c = &h.controller;
    let worker = c.worker("node1").expect("worker");
    wait_free_sgroups(worker, 1).await;
    let sg = activated_chain(&h).await;

    // Establish the max-rate estimate from an egress report, then push the
    // ingress rate to 90% of it.
    let ports = sg.instance_ports().await;
    let (ingress, egress) = (ports[0], ports[1]);
    c.instance_update_stats("node1", egress, 0, 0.0, 985)
        .await
        .expect("egress stats");
    let max_rate = sg.snapshot().await.max_rate_kpps;
    assert!(max_rate > 0.0);
    c.instance_update_stats("node1", ingress, 0, 0.9 * max_rate, 290)
        .await
        .expect("ingress stats");
    let snap = sg.snapshot().await;
    assert!(snap.pkt_load > 80.0, "pkt load {:.1}", snap.pkt_load);

    // One spare NIC queue for the scale-up.
    worker.request_free_sgroups(1).await;
    wait_free_sgroups(worker, 1).await;

    let entry = c.update_flow(&flow(8080)).await.expect("scale-up dispatch");
    assert_ne!(entry.dmac, nic::dst_mac(sg.id()).expect("mac"));

    wait_until("clone construction", || async move {
        let sgs = worker.sgroups().await;
        sgs.len() == 2 && sgs[1].instance_ports().await.len() == 2
    })
    .await;
    let clone = worker
        .sgroups()
        .await
        .into_iter()
        .find(|s| s.id() != sg.id())
        .expect("cloned sgroup");
    assert_eq!(entry.dmac, nic::dst_mac(clone.id()).expect("mac"));
    report_tids(&h, "node1", &clone).await;

    // Traffic arrives, then dies down: active after the first busy sample,
    // idle again after ten silent ones.
    let clone_ingress = clone.instance_ports().await[0];
    c.instance_update_stats("node1", clone_ingress, 5, 1.0, 290)
        .await
        .expect("busy sample");
    assert!(clone.snapshot().await.active);
    for i in 0..MIN_IDLE_SAMPLES {
        assert!(clone.snapshot().await.active, "idle too early at sample {i}");
        c.instance_update_stats("node1", clone_ingress, 0, 0.0, 290)
            .await
            .expect("silent sample");
    }
    assert!(!clone.snapshot().await.active);
}

#[tokio::test]
async fn s5_packing_converges_to_two_cores() {
    // Metron mode keeps the background packing loop idle, so the single
    // pass below is the only one that runs.
    let h = harness(metron_tunables(4), 1, 4, 8).await;
    let c = &h.controller;
    let worker = c.worker("node1").expect("worker");
    wait_free_sgroups(worker, 4).await;

    let mut sgs = Vec::new();
    for _ in 0..4 {
        let id = c
            .create_sgroup("node1", &["filter".to_string()])
            .await
            .expect("manual chain");
        let sg = worker.find_sgroup(id).await.expect("deployed");
        report_tids(&h, "node1", &sg).await;
        sgs.push(sg);
    }

    // Give the groups packet loads 30, 25, 20, 15.
    for (sg, load) in sgs.iter().zip([30.0, 25.0, 20.0, 15.0]) {
        let port = sg.instance_ports().await[0];
        c.instance_update_stats("node1", port, 0, 1.0, 50)
            .await
            .expect("seed stats");
        let max_rate = sg.snapshot().await.max_rate_kpps;
        assert!(max_rate > 0.0);
        c.instance_update_stats("node1", port, 0, load / 100.0 * max_rate, 50)
            .await
            .expect("load stats");
    }

    worker.schedule_once().await;

    let first_serving_core = worker.startup_core() + 1;
    for (sg, load) in sgs.iter().zip([30.0, 25.0, 20.0, 15.0]) {
        let snap = sg.snapshot().await;
        assert!((snap.pkt_load - load).abs() < 0.5, "load {:.1}", snap.pkt_load);
        let want = if load > 15.0 {
            first_serving_core
        } else {
            first_serving_core + 1
        };
        assert_eq!(snap.core_id, Some(want), "group with load {load}");
        assert!(snap.sched);
    }
}

#[tokio::test]
async fn s6_clean_shutdown_drains_everything() {
    let h = harness(faas_tunables(3), 1, 3, 8).await;
    let c = &h.controller;
    let worker = c.worker("node1").expect("worker");
    wait_free_sgroups(worker, 3).await;

    let id = c
        .create_sgroup("node1", &["nat".to_string()])
        .await
        .expect("manual chain");
    let sg = worker.find_sgroup(id).await.expect("deployed");
    report_tids(&h, "node1", &sg).await;
    assert_eq!(worker.free_sgroup_count().await, 2);

    c.close().await.expect("close");

    assert!(h.sched.killed());
    assert_eq!(worker.free_sgroup_count().await, 0);
    assert!(worker.sgroups().await.is_empty());
    assert!(
        h.orch.deployment_names().is_empty(),
        "pods left behind: {:?}",
        h.orch.deployment_names()
    );

    // Idempotent in effect.
    c.close().await.expect("second close");
}

#[tokio::test]
async fn attach_detach_reattach_contract() {
    let h = harness(metron_tunables(1), 1, 1, 8).await;
    let c = &h.controller;
    let worker = c.worker("node1").expect("worker");
    wait_free_sgroups(worker, 1).await;

    let id = c
        .create_sgroup("node1", &["acl".to_string()])
        .await
        .expect("manual chain");
    let sg = worker.find_sgroup(id).await.expect("deployed");
    report_tids(&h, "node1", &sg).await;

    c.attach_sgroup("node1", id, 3).await.expect("attach");
    let snap = sg.snapshot().await;
    assert_eq!((snap.core_id, snap.sched), (Some(3), true));

    c.detach_sgroup("node1", id).await.expect("detach");
    let snap = sg.snapshot().await;
    assert!(snap.ready);
    assert!(!snap.sched);
    assert_eq!(snap.core_id, Some(3));

    // Re-engaging on the same core is not a no-op when detached.
    let attaches_before = count_attaches(&h);
    c.attach_sgroup("node1", id, 3).await.expect("re-attach");
    let snap = sg.snapshot().await;
    assert_eq!((snap.core_id, snap.sched), (Some(3), true));
    assert_eq!(count_attaches(&h), attaches_before + 1);

    // But it is one while still scheduled there.
    c.attach_sgroup("node1", id, 3).await.expect("no-op attach");
    assert_eq!(count_attaches(&h), attaches_before + 1);
}

fn count_attaches(h: &Harness) -> usize {
    h.sched
        .calls()
        .iter()
        .filter(|call| call.starts_with("attach"))
        .count()
}

#[tokio::test]
async fn pool_invariants_hold_across_groups() {
    let h = harness(metron_tunables(3), 1, 3, 8).await;
    let c = &h.controller;
    let worker = c.worker("node1").expect("worker");
    wait_free_sgroups(worker, 3).await;

    for chain in [vec!["vlanpush".to_string(), "acl".to_string()], vec!["nat".to_string()]] {
        let id = c.create_sgroup("node1", &chain).await.expect("chain");
        let sg = worker.find_sgroup(id).await.expect("deployed");
        report_tids(&h, "node1", &sg).await;
    }

    let deployed = worker.sgroups().await;
    let free: Vec<Arc<SGroup>> = {
        // The remaining free group: take it out and put it back.
        let sg = worker.get_free_sgroup().await.expect("one free");
        worker.put_back_free_sgroup(&sg).await;
        vec![sg]
    };
    assert_eq!(deployed.len(), 2);

    // Back-references and disjointness.
    let mut ids = Vec::new();
    for sg in deployed.iter().chain(free.iter()) {
        assert_eq!(sg.worker().expect("worker ref").name(), "node1");
        ids.push(sg.id());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3, "pcie indices must be unique");

    // Free groups carry no NF instances and no core.
    let free_snap = free[0].snapshot().await;
    assert_eq!(free_snap.instances, 0);
    assert_eq!(free_snap.core_id, None);
    assert!(!free_snap.ready);

    // Ready groups have one tid per instance; host ports never collide.
    let mut ports = Vec::new();
    for sg in &deployed {
        let snap = sg.snapshot().await;
        assert!(snap.ready);
        assert_eq!(sg.tids().await.len(), snap.instances);
        ports.extend(sg.instance_ports().await);
    }
    let total = ports.len();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), total, "instance ports must be unique");
}

#[tokio::test]
async fn dispatch_prefers_groups_under_the_ceiling() {
    let h = harness(metron_tunables(2), 1, 2, 8).await;
    let c = &h.controller;
    let worker = c.worker("node1").expect("worker");
    wait_free_sgroups(worker, 2).await;

    c.add_nf("u", "filter");
    c.add_flow("u", "", "", 0, 8080, 0).expect("add flow");
    // Activate the graph directly; chains are built by hand below.
    let dag = c.dag("u").expect("dag");
    dag.activate().expect("activate");
    let mut sgs = Vec::new();
    for _ in 0..2 {
        let sg = worker.get_free_sgroup().await.expect("free");
        worker
            .create_sgroup(&sg, &["filter".to_string()], Some(("u".to_string(), dag.clone())))
            .await;
        report_tids(&h, "node1", &sg).await;
        sgs.push(sg);
    }

    for (sg, load) in sgs.iter().zip([90.0, 50.0]) {
        let port = sg.instance_ports().await[0];
        c.instance_update_stats("node1", port, 0, 1.0, 50)
            .await
            .expect("seed stats");
        let max_rate = sg.snapshot().await.max_rate_kpps;
        c.instance_update_stats("node1", port, 0, load / 100.0 * max_rate, 50)
            .await
            .expect("load stats");
    }

    // The overloaded group is never picked while a group under the
    // ceiling exists.
    let entry = c.update_flow(&flow(8080)).await.expect("dispatch");
    assert_eq!(entry.dmac, nic::dst_mac(sgs[1].id()).expect("mac"));
}

#[tokio::test]
async fn failed_deploy_rolls_the_group_back_to_free() {
    let h = harness(metron_tunables(1), 1, 1, 8).await;
    let c = &h.controller;
    let worker = c.worker("node1").expect("worker");
    wait_free_sgroups(worker, 1).await;

    // The manager pod is already up; the next deploy (first chain NF)
    // succeeds and the second fails.
    let deployed_so_far = h.orch.nf_specs().len();
    h.orch.fail_deploys_from(deployed_so_far + 1);

    let got = c
        .create_sgroup("node1", &["vlanpush".to_string(), "acl".to_string()])
        .await;
    assert!(got.is_err(), "construction must fail: {got:?}");

    assert!(worker.sgroups().await.is_empty());
    assert_eq!(worker.free_sgroup_count().await, 1);
    let sg = worker.get_free_sgroup().await.expect("back in the pool");
    assert_eq!(sg.instance_ports().await.len(), 0);
}

#[tokio::test]
async fn metron_activation_and_port_driven_scale_up() {
    let h = harness(metron_tunables(2), 1, 2, 8).await;
    let c = &h.controller;
    let worker = c.worker("node1").expect("worker");
    wait_free_sgroups(worker, 2).await;

    c.add_nf("u", "fc");
    c.add_nf("u", "nat");
    c.connect_nfs("u", 0, 1).expect("connect");
    c.add_flow("u", "", "", 0, 0, 0).expect("add flow");
    c.activate_dag("u").await.expect("activate");

    // Metron deploys the chain as one consolidated instance.
    wait_until("consolidated chain", || async move {
        let sgs = worker.sgroups().await;
        !sgs.is_empty() && sgs[0].instance_ports().await.len() == 1
    })
    .await;
    let sg = worker.sgroups().await.remove(0);
    assert_ne!(sg.snapshot().await.core_id, None);
    report_tids(&h, "node1", &sg).await;

    let spec = h
        .orch
        .nf_specs()
        .into_iter()
        .find(|s| s.func_types == vec!["fc".to_string(), "nat".to_string()])
        .expect("consolidated pod spec");
    assert!(spec.is_ingress && spec.is_egress);

    // Overload it and report the port: the controller clones the chain.
    let port = sg.instance_ports().await[0];
    c.instance_update_stats("node1", port, 0, 1.0, 1600)
        .await
        .expect("seed stats");
    let max_rate = sg.snapshot().await.max_rate_kpps;
    c.instance_update_stats("node1", port, 0, 0.9 * max_rate, 1600)
        .await
        .expect("overload stats");

    let affected = c.update_port(&[worker.switch_port()]).await;
    assert_eq!(affected, vec![sg.id() as i32]);

    wait_until("cloned chain", || async move {
        worker.sgroups().await.len() == 2
    })
    .await;
    let clone = worker
        .sgroups()
        .await
        .into_iter()
        .find(|s| s.id() != sg.id())
        .expect("clone");
    report_tids(&h, "node1", &clone).await;
    assert_ne!(clone.snapshot().await.core_id, Some(worker.startup_core()));
}
