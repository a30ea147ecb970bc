// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Wire message types for every control surface.

use serde::{Deserialize, Serialize};

/// Five-tuple reported by the ingress switch for the first packet of a
/// new flow. Empty / zero fields are wildcards on the matching side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowInfo {
    pub ipv4_src: String,
    pub ipv4_dst: String,
    pub tcp_sport: u32,
    pub tcp_dport: u32,
    pub ipv4_protocol: u32,
}

/// Forwarding decision returned to the switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowTableEntry {
    pub switch_port: u32,
    pub dmac: String,
}

impl FlowTableEntry {
    /// The entry returned when no chain can serve the flow.
    pub fn none() -> Self {
        FlowTableEntry {
            switch_port: 0,
            dmac: "none".to_string(),
        }
    }
}

/// Generic status reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: i32,
    pub errmsg: String,
}

impl RpcStatus {
    pub fn ok() -> Self {
        RpcStatus {
            code: 0,
            errmsg: String::new(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        RpcStatus {
            code: 1,
            errmsg: msg.into(),
        }
    }
}

/// Requests accepted by the controller's server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CtrlRequest {
    UpdateFlow(FlowInfo),
    UpdatePort {
        ports: Vec<u32>,
    },
    InstanceSetUp {
        node_name: String,
        port: u16,
        tid: i32,
    },
    InstanceUpdateStats {
        node_name: String,
        port: u16,
        queue_length: u32,
        rate_kpps: f64,
        cycles_per_packet: u32,
    },
}

/// Responses issued by the controller's server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CtrlResponse {
    FlowTableEntry(FlowTableEntry),
    AffectedSGroups { sgroups: Vec<i32> },
    Status(RpcStatus),
}

/// Requests to a worker's cooperative scheduler agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedRequest {
    SetupChain { tids: Vec<i32> },
    RemoveChain { tids: Vec<i32> },
    AttachChain { tids: Vec<i32>, core: u32 },
    DetachChain { tids: Vec<i32>, core: u32 },
    KillSched,
}

/// Requests to one NF instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NfRequest {
    SetCycles { cycles_per_packet: u32 },
    SetBatch { batch_size: u32, batch_count: u32 },
    GetTcStats,
    GetPortQueueStats,
}

/// Responses from one NF instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NfResponse {
    Status(RpcStatus),
    TcStats(TcStats),
    PortQueueStats(PortQueueStats),
}

/// Traffic-class counters of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcStats {
    pub timestamp: u64,
    pub count: u64,
    pub cycles: u64,
    pub packets: u64,
    pub bits: u64,
}

/// Queue occupancy of the port an instance reads from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortQueueStats {
    pub inc_length: u32,
    pub inc_capacity: u32,
    pub out_length: u32,
    pub out_capacity: u32,
}
