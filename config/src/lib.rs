// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Cluster topology, NF profiles and process-wide tunables for the
//! FaaS-NFV controller.

pub mod cluster;
pub mod nic;
pub mod params;
pub mod profile;

pub use cluster::{ClusterSpec, NodeSpec};
pub use params::{ControllerMode, LoadBalanceMode, PackingPolicy, Tunables};
