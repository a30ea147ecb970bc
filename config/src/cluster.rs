// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Cluster topology file model. The topology is loaded once at startup and
//! treated as injected, immutable configuration afterwards.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read cluster file '{0}': {1}")]
    Read(String, std::io::Error),

    #[error("failed to parse cluster file '{0}': {1}")]
    Parse(String, serde_json::Error),

    #[error("cluster file declares no workers")]
    NoWorkers,
}

/// One node entry in the cluster file. The same shape is used for the
/// master, the OpenFlow controller node and every worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(rename = "nodeName")]
    pub node_name: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(default)]
    pub password: String,
    /// PCIe VF addresses (BDF strings) usable for NIC queues on this node.
    #[serde(rename = "PCIe", default)]
    pub pcie: Vec<String>,
    /// Total logical cores. One core is reserved for the cooperative
    /// scheduler agent, so the controller manages `cpu - 1` of them.
    #[serde(rename = "CPU", default)]
    pub cpu: u32,
    #[serde(rename = "switchPort", default)]
    pub switch_port: u32,
}

/// The whole cluster: one master (runs this controller), an optional
/// OpenFlow controller node and the worker nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub master: NodeSpec,
    #[serde(default)]
    pub ofctl: NodeSpec,
    pub workers: Vec<NodeSpec>,
}

impl ClusterSpec {
    /// Load and parse a cluster topology file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read(shown.clone(), e))?;
        let cluster: ClusterSpec =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(shown, e))?;
        if cluster.workers.is_empty() {
            return Err(ConfigError::NoWorkers);
        }

        info!(
            "cluster: master={} ({}), ofctl={}, {} workers",
            cluster.master.node_name,
            cluster.master.ip,
            cluster.ofctl.node_name,
            cluster.workers.len()
        );
        for (i, w) in cluster.workers.iter().enumerate() {
            info!(
                "  worker[{i}]: name={}, ip={}, {} VFs, {} cores, switch port {}",
                w.node_name,
                w.ip,
                w.pcie.len(),
                w.cpu,
                w.switch_port
            );
        }
        Ok(cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "master": { "nodeName": "master", "IP": "10.0.0.1" },
        "ofctl":  { "nodeName": "ofctl", "IP": "10.0.0.2", "password": "x" },
        "workers": [
            {
                "nodeName": "node1",
                "IP": "10.0.0.11",
                "PCIe": ["5e:02.0", "5e:02.1"],
                "CPU": 8,
                "switchPort": 1
            }
        ]
    }"#;

    #[test]
    fn parse_sample() {
        let cluster: ClusterSpec = serde_json::from_str(SAMPLE).expect("parse");
        assert_eq!(cluster.master.node_name, "master");
        assert_eq!(cluster.ofctl.password, "x");
        assert_eq!(cluster.workers.len(), 1);
        let w = &cluster.workers[0];
        assert_eq!(w.node_name, "node1");
        assert_eq!(w.pcie.len(), 2);
        assert_eq!(w.cpu, 8);
        assert_eq!(w.switch_port, 1);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(matches!(
            ClusterSpec::load("/definitely/not/here.json"),
            Err(ConfigError::Read(..))
        ));
    }
}
