// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Publisher towards the OpenFlow controller (Metron mode). Commands are
//! short textual messages on a Redis pub/sub channel.

use redis::AsyncCommands;
use tracing::{debug, info};

use crate::wire::RpcError;

/// Pub/sub channel the switch controller subscribes to.
const CONTROL_PLANE_CHANNEL: &str = "metronctl";

pub struct OfctlClient {
    conn: redis::aio::MultiplexedConnection,
}

impl OfctlClient {
    /// Connect to the Redis server at `addr` (`host:port`).
    pub async fn connect(addr: &str, password: &str) -> Result<Self, RpcError> {
        let url = if password.is_empty() {
            format!("redis://{addr}/")
        } else {
            format!("redis://:{password}@{addr}/")
        };
        let client = redis::Client::open(url).map_err(|e| RpcError::Redis(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RpcError::Redis(e.to_string()))?;
        info!("connected to ofctl redis at {addr}");
        Ok(OfctlClient { conn })
    }

    async fn publish(&self, msg: String) -> Result<(), RpcError> {
        debug!("ofctl <- {msg}");
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .publish(CONTROL_PLANE_CHANNEL, msg)
            .await
            .map_err(|e| RpcError::Redis(e.to_string()))?;
        Ok(())
    }

    /// Announce a scheduling group's routing (id, switch port, dmac).
    pub async fn sgroup_up(&self, sg: usize, switch_port: u32, dmac: &str) -> Result<(), RpcError> {
        self.publish(format!("sgup,{sg},{switch_port},{dmac}")).await
    }

    /// Split the traffic class of `first` with `second`.
    pub async fn split(&self, first: usize, second: usize) -> Result<(), RpcError> {
        self.publish(format!("split,{first},{second}")).await
    }

    /// Announce a new group and split `first`'s traffic with it in one step.
    pub async fn sgroup_up_split(
        &self,
        first: usize,
        second: usize,
        switch_port: u32,
        dmac: &str,
    ) -> Result<(), RpcError> {
        self.publish(format!("sgupsplit,{first},{second},{switch_port},{dmac}"))
            .await
    }

    /// Merge `second`'s traffic back into `first`.
    pub async fn merge(&self, first: usize, second: usize) -> Result<(), RpcError> {
        self.publish(format!("merge,{first},{second}")).await
    }
}
