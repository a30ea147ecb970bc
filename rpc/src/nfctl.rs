// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Client for the control server inside each NF container.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use faas_config::params::{
    RPC_CALL_TIMEOUT, RPC_CALL_TRIALS, RPC_CONNECT_TIMEOUT, RPC_CONNECT_TRIALS,
};

use crate::backoff::Backoff;
use crate::msg::{NfRequest, NfResponse, PortQueueStats, TcStats};
use crate::wire::{self, RpcError};

/// The controller's view of the per-instance control surface, keyed by the
/// instance address (`ip:port`).
#[async_trait]
pub trait NfCtl: Send + Sync {
    async fn set_cycles(&self, addr: &str, cycles_per_packet: u32) -> Result<(), RpcError>;
    async fn set_batch(&self, addr: &str, batch_size: u32, batch_count: u32)
        -> Result<(), RpcError>;
    async fn tc_stats(&self, addr: &str) -> Result<TcStats, RpcError>;
    async fn port_queue_stats(&self, addr: &str) -> Result<PortQueueStats, RpcError>;
    /// Drop the cached connection for a departed instance.
    async fn forget(&self, addr: &str);
}

/// Wire implementation with a connection cache per instance address.
#[derive(Default)]
pub struct NfCtlClient {
    conns: Mutex<HashMap<String, TcpStream>>,
}

impl NfCtlClient {
    pub fn new() -> Self {
        NfCtlClient::default()
    }

    async fn connect(addr: &str) -> Result<TcpStream, RpcError> {
        let backoff = Backoff::default();
        let mut last = RpcError::ConnectFailed(addr.to_string());
        for _ in 0..RPC_CONNECT_TRIALS {
            match wire::connect(addr, RPC_CONNECT_TIMEOUT).await {
                Ok(sock) => return Ok(sock),
                Err(e) => {
                    warn!("instance {addr}: {e}");
                    last = e;
                }
            }
            sleep(backoff.duration()).await;
        }
        Err(last)
    }

    async fn call(&self, addr: &str, req: &NfRequest) -> Result<NfResponse, RpcError> {
        let backoff = Backoff::default();
        let mut last = RpcError::ConnectFailed(addr.to_string());
        for trial in 0..RPC_CALL_TRIALS {
            {
                let mut conns = self.conns.lock().await;
                if !conns.contains_key(addr) {
                    match Self::connect(addr).await {
                        Ok(sock) => {
                            conns.insert(addr.to_string(), sock);
                        }
                        Err(e) => {
                            last = e;
                            continue;
                        }
                    }
                }
                let sock = conns.get_mut(addr).expect("connection just inserted");
                match wire::call::<_, NfResponse>(sock, req, RPC_CALL_TIMEOUT).await {
                    Ok(NfResponse::Status(status)) if status.code != 0 => {
                        last = RpcError::Status {
                            code: status.code,
                            errmsg: status.errmsg,
                        };
                    }
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        conns.remove(addr);
                        last = e;
                    }
                }
            }
            debug!("instance {addr} trial {trial} failed: {last}");
            sleep(backoff.duration()).await;
        }
        Err(last)
    }
}

#[async_trait]
impl NfCtl for NfCtlClient {
    async fn set_cycles(&self, addr: &str, cycles_per_packet: u32) -> Result<(), RpcError> {
        match self.call(addr, &NfRequest::SetCycles { cycles_per_packet }).await? {
            NfResponse::Status(_) => Ok(()),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    async fn set_batch(
        &self,
        addr: &str,
        batch_size: u32,
        batch_count: u32,
    ) -> Result<(), RpcError> {
        let req = NfRequest::SetBatch {
            batch_size,
            batch_count,
        };
        match self.call(addr, &req).await? {
            NfResponse::Status(_) => Ok(()),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    async fn tc_stats(&self, addr: &str) -> Result<TcStats, RpcError> {
        match self.call(addr, &NfRequest::GetTcStats).await? {
            NfResponse::TcStats(stats) => Ok(stats),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    async fn port_queue_stats(&self, addr: &str) -> Result<PortQueueStats, RpcError> {
        match self.call(addr, &NfRequest::GetPortQueueStats).await? {
            NfResponse::PortQueueStats(stats) => Ok(stats),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    async fn forget(&self, addr: &str) {
        self.conns.lock().await.remove(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::RpcStatus;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn batch_and_stats_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            loop {
                let req: NfRequest = match wire::recv_msg(&mut sock).await {
                    Ok(req) => req,
                    Err(_) => return,
                };
                let resp = match req {
                    NfRequest::SetBatch {
                        batch_size,
                        batch_count,
                    } => {
                        assert_eq!((batch_size, batch_count), (32, 8));
                        NfResponse::Status(RpcStatus::ok())
                    }
                    NfRequest::GetPortQueueStats => NfResponse::PortQueueStats(PortQueueStats {
                        inc_length: 17,
                        inc_capacity: 4096,
                        ..Default::default()
                    }),
                    _ => NfResponse::Status(RpcStatus::ok()),
                };
                wire::send_msg(&mut sock, &resp).await.unwrap();
            }
        });

        let client = NfCtlClient::new();
        client.set_batch(&addr, 32, 8).await.unwrap();
        let stats = client.port_queue_stats(&addr).await.unwrap();
        assert_eq!(stats.inc_length, 17);
        assert_eq!(stats.inc_capacity, 4096);
    }
}
