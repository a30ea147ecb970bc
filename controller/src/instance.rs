// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! One NF container. Owned by its scheduling group; mutated only under the
//! group's lock.

use std::fmt;

/// Record of one container. `tid` stays `None` until the instance reports
/// its thread id over the control server.
#[derive(Debug, Clone)]
pub struct Instance {
    pub func_type: String,
    /// Host TCP port of the instance's control server; unique per worker
    /// and used as the instance id.
    pub port: u16,
    /// Full `ip:port` address of the control server.
    pub address: String,
    pub pod_name: String,
    pub is_primary: bool,
    pub is_ingress: bool,
    pub is_egress: bool,
    /// Profiled cycles per packet for this function type.
    pub profiled_cycles: u32,
    /// Thread id reported by the runtime once the container is up.
    pub tid: Option<i32>,
    /// Live telemetry.
    pub cycles_per_packet: u32,
    pub queue_length: u32,
    pub rate_kpps: f64,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        func_type: impl Into<String>,
        port: u16,
        address: impl Into<String>,
        pod_name: impl Into<String>,
        profiled_cycles: u32,
        is_primary: bool,
        is_ingress: bool,
        is_egress: bool,
    ) -> Self {
        Instance {
            func_type: func_type.into(),
            port,
            address: address.into(),
            pod_name: pod_name.into(),
            is_primary,
            is_ingress,
            is_egress,
            profiled_cycles,
            tid: None,
            cycles_per_packet: 0,
            queue_length: 0,
            rate_kpps: 0.0,
        }
    }

    /// Live cycle cost, falling back to the profile before the first
    /// telemetry report.
    pub fn cycle_cost(&self) -> u32 {
        if self.cycles_per_packet > 0 {
            self.cycles_per_packet
        } else {
            self.profiled_cycles
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.func_type, self.port)
    }
}
