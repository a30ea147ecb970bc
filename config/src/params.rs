// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Process-wide tunables. Everything here is loaded at init and injected
//! into the components that need it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Host ports taken by NF instances on a worker are drawn from
/// `[INSTANCE_PORT_BASE, INSTANCE_PORT_BASE + INSTANCE_PORT_COUNT)`.
pub const INSTANCE_PORT_BASE: u32 = 50052;
pub const INSTANCE_PORT_COUNT: u32 = 1000;

/// Capacity of the NIC queue owned by each scheduling group's manager.
pub const NIC_QUEUE_CAPACITY: u32 = 4096;

/// Default per-NF batch size.
pub const DEFAULT_BATCH_SIZE: u32 = 32;
/// Target CPU share spent in NF code rather than context switching.
pub const BATCH_TARGET_UTILIZATION: f64 = 0.95;
/// Approximate cycle cost of one scheduling interrupt.
pub const CONTEXT_SWITCH_CYCLES: u32 = 5100;
/// Worker core frequency in kHz; divides cycles/packet into kpps.
pub const CORE_FREQ_KHZ: f64 = 1_700_000.0;

/// A scheduling group above this packet-load percentage is overloaded.
pub const PKT_LOAD_CEILING: f64 = 80.0;
/// Queue-load percentage above which new flows avoid a group.
pub const Q_LOAD_CEILING: f64 = 40.0;
/// Consecutive all-zero telemetry samples before a group is considered idle.
pub const MIN_IDLE_SAMPLES: u32 = 10;

pub const SCHEDULE_INTERVAL: Duration = Duration::from_millis(500);
pub const POD_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const POD_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Cap on scheduling groups under construction on one worker.
pub const MAX_STARTUP_SGROUPS_PER_WORKER: usize = 20;
pub const STARTUP_THROTTLE_PAUSE: Duration = Duration::from_millis(500);

/// TCP port of the control-plane server on the master.
pub const CONTROL_PORT: u16 = 10515;
/// TCP port of the cooperative scheduler agent on every worker.
pub const SCHED_AGENT_PORT: u16 = 10515;
/// Redis port on the ofctl node (Metron mode).
pub const OFCTL_REDIS_PORT: u16 = 6379;

pub const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const RPC_CALL_TIMEOUT: Duration = Duration::from_secs(1);
pub const RPC_CONNECT_TRIALS: u32 = 3;
pub const RPC_CALL_TRIALS: u32 = 5;

pub const BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const BACKOFF_MAX: Duration = Duration::from_secs(5);
pub const BACKOFF_FACTOR: f64 = 2.0;

/// Chains brought up per DAG when Metron mode activates a deployment.
pub const METRON_STARTUP_SGROUPS: usize = 1;

pub const DEFAULT_CLUSTER_PATH: &str = "./cloudlab_cluster.json";

/// How a new flow picks among the serving scheduling groups.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum LoadBalanceMode {
    /// Concentrate traffic on the busiest group under the ceiling.
    #[default]
    HighLoadFirst,
    /// Spread traffic to the least busy group under the ceiling.
    LowLoadFirst,
}

/// Top-level controller mode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum ControllerMode {
    /// Chains migrate between cores under the periodic packing scheduler.
    #[default]
    Faas,
    /// Chains are pinned at creation; scale-up is driven by port updates
    /// and published to the OpenFlow controller.
    Metron,
}

/// Core-packing policy of the per-worker scheduler loop.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum PackingPolicy {
    /// Best-Fit Decreasing under the load ceiling.
    #[default]
    BestFit,
    /// One idle core per active group.
    NoPacking,
}

/// Bag of runtime-selected knobs, injected at construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tunables {
    pub mode: ControllerMode,
    pub load_balance: LoadBalanceMode,
    pub packing: PackingPolicy,
    /// Free groups created per worker at startup; `None` warms the whole
    /// VF pool.
    pub warm_free_sgroups: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn enums_parse_kebab_case() {
        assert_eq!(
            LoadBalanceMode::from_str("high-load-first").unwrap(),
            LoadBalanceMode::HighLoadFirst
        );
        assert_eq!(
            LoadBalanceMode::from_str("LOW-LOAD-FIRST").unwrap(),
            LoadBalanceMode::LowLoadFirst
        );
        assert_eq!(ControllerMode::from_str("metron").unwrap(), ControllerMode::Metron);
        assert_eq!(PackingPolicy::from_str("no-packing").unwrap(), PackingPolicy::NoPacking);
    }

    #[test]
    fn port_range_is_the_reserved_block() {
        assert_eq!(INSTANCE_PORT_BASE, 50052);
        assert_eq!(INSTANCE_PORT_BASE + INSTANCE_PORT_COUNT - 1, 51051);
    }
}
