// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Deployment naming and manifest rendering.

use serde_json::{Value, json};

use crate::NfPodSpec;

/// Registry account the NF runtime images are published under.
const IMAGE_REGISTRY: &str = "faasnfv";
/// Control server port inside every NF container.
const CONTAINER_CTRL_PORT: u16 = 50051;

/// Deployment name for an NF instance. The host port is unique per worker,
/// which keeps the name unique cluster-wide together with the node name.
pub fn nf_deployment_name(node: &str, spec_label: &str, host_port: u16) -> String {
    format!("faas-{node}-{spec_label}-{host_port}")
}

/// Deployment name for a worker's cooperative scheduler agent.
pub fn sched_deployment_name(node: &str) -> String {
    format!("faas-sched-{node}")
}

fn label_of(func_types: &[String]) -> String {
    func_types.join("-").to_lowercase()
}

/// Render the deployment manifest for one NF container. The pod is pinned
/// to the worker node, maps the instance control port onto the host, and
/// mounts the hugepage and device paths the NF runtime needs.
pub fn render_nf_deployment(spec: &NfPodSpec) -> (String, Value) {
    let label = label_of(&spec.func_types);
    let name = nf_deployment_name(&spec.node, &label, spec.host_port);

    let mut command = vec![
        "/app/main".to_string(),
        format!("--mods={}", spec.func_types.join(",")),
        format!("--pcie={}", spec.pcie),
        format!("--worker_core={}", spec.core),
        format!("--vport_in={}", spec.vport_in),
        format!("--vport_out={}", spec.vport_out),
    ];
    if spec.is_primary {
        command.push("--primary".to_string());
    }
    if spec.is_ingress {
        command.push("--ingress".to_string());
    }
    if spec.is_egress {
        command.push("--egress".to_string());
    }

    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "labels": { "app": name } },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": {
                    "nodeName": spec.node,
                    "containers": [{
                        "name": label,
                        "image": format!("{IMAGE_REGISTRY}/nf:base"),
                        "imagePullPolicy": "Always",
                        "ports": [{
                            "containerPort": CONTAINER_CTRL_PORT,
                            "hostPort": spec.host_port,
                        }],
                        "command": command,
                        "securityContext": { "privileged": true },
                        "volumeMounts": [
                            { "name": "pcidriver", "mountPath": "/sys/bus/pci/drivers" },
                            { "name": "hugepage", "mountPath": "/sys/kernel/mm/hugepages" },
                            { "name": "huge", "mountPath": "/mnt/huge" },
                            { "name": "dev", "mountPath": "/dev" },
                            { "name": "numa", "mountPath": "/sys/devices/system/node" },
                            { "name": "runtime", "mountPath": "/var/run" },
                        ],
                    }],
                    "volumes": [
                        { "name": "pcidriver", "hostPath": { "path": "/sys/bus/pci/drivers" } },
                        { "name": "hugepage", "hostPath": { "path": "/sys/kernel/mm/hugepages" } },
                        { "name": "huge", "hostPath": { "path": "/mnt/huge" } },
                        { "name": "dev", "hostPath": { "path": "/dev" } },
                        { "name": "numa", "hostPath": { "path": "/sys/devices/system/node" } },
                        { "name": "runtime", "hostPath": { "path": "/var/run" } },
                    ],
                },
            },
        },
    });
    (name, manifest)
}

/// Render the deployment manifest for a worker's scheduler agent.
pub fn render_sched_deployment(node: &str) -> (String, Value) {
    let name = sched_deployment_name(node);
    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "labels": { "app": name } },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": {
                    "nodeName": node,
                    "hostNetwork": true,
                    "containers": [{
                        "name": "coop-sched",
                        "image": format!("{IMAGE_REGISTRY}/sched:base"),
                        "imagePullPolicy": "Always",
                        "securityContext": { "privileged": true },
                        "volumeMounts": [
                            { "name": "runtime", "mountPath": "/var/run" },
                        ],
                    }],
                    "volumes": [
                        { "name": "runtime", "hostPath": { "path": "/var/run" } },
                    ],
                },
            },
        },
    });
    (name, manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> NfPodSpec {
        NfPodSpec {
            node: "node1".into(),
            func_types: vec!["vlanpush".into(), "acl".into()],
            host_port: 50054,
            pcie: "5e:02.0".into(),
            core: 1,
            is_primary: false,
            is_ingress: true,
            is_egress: false,
            vport_in: 0,
            vport_out: 1,
        }
    }

    #[test]
    fn names_are_deterministic() {
        assert_eq!(
            nf_deployment_name("node1", "vlanpush-acl", 50054),
            "faas-node1-vlanpush-acl-50054"
        );
        assert_eq!(sched_deployment_name("node1"), "faas-sched-node1");
    }

    #[test]
    fn manifest_pins_node_and_port() {
        let (name, manifest) = render_nf_deployment(&sample_spec());
        assert_eq!(name, "faas-node1-vlanpush-acl-50054");
        let tmpl = &manifest["spec"]["template"]["spec"];
        assert_eq!(tmpl["nodeName"], "node1");
        assert_eq!(tmpl["containers"][0]["ports"][0]["hostPort"], 50054);
        let command: Vec<String> = tmpl["containers"][0]["command"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(command.contains(&"--ingress".to_string()));
        assert!(!command.contains(&"--egress".to_string()));
        assert!(command.contains(&"--mods=vlanpush,acl".to_string()));
    }

    #[test]
    fn manifest_parses_as_deployment() {
        let (_, manifest) = render_nf_deployment(&sample_spec());
        let dep: k8s_openapi::api::apps::v1::Deployment =
            serde_json::from_value(manifest).expect("valid deployment");
        assert_eq!(dep.metadata.name.as_deref(), Some("faas-node1-vlanpush-acl-50054"));
    }
}
