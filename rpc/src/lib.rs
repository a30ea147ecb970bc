// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Control-plane wire protocol and agent clients.
//!
//! Every control conversation in the cluster (ingress switch to controller,
//! controller to cooperative scheduler agents, controller to NF instances)
//! uses the same framing: a 4-octet big-endian length followed by a
//! bincode-encoded message.

pub mod backoff;
pub mod msg;
pub mod nfctl;
pub mod ofctl;
pub mod sched;
pub mod wire;

pub use backoff::Backoff;
pub use msg::*;
pub use nfctl::{NfCtl, NfCtlClient};
pub use ofctl::OfctlClient;
pub use sched::{ChainScheduler, SchedClient};
pub use wire::RpcError;
