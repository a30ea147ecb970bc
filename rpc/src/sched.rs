// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Client for the per-worker cooperative scheduler agent.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use faas_config::params::{
    RPC_CALL_TIMEOUT, RPC_CALL_TRIALS, RPC_CONNECT_TIMEOUT, RPC_CONNECT_TRIALS,
};

use crate::backoff::Backoff;
use crate::msg::{RpcStatus, SchedRequest};
use crate::wire::{self, RpcError};

/// The controller's view of a worker's cooperative scheduler. The wire
/// implementation is [`SchedClient`]; tests substitute their own.
#[async_trait]
pub trait ChainScheduler: Send + Sync {
    /// Register the chain's threads with the scheduler, unscheduled.
    async fn setup_chain(&self, tids: &[i32]) -> Result<(), RpcError>;
    /// Forget the chain's threads.
    async fn remove_chain(&self, tids: &[i32]) -> Result<(), RpcError>;
    /// Schedule the chain on `core`.
    async fn attach_chain(&self, tids: &[i32], core: u32) -> Result<(), RpcError>;
    /// Stop executing the chain and return its threads to the free pool.
    async fn detach_chain(&self, tids: &[i32], core: u32) -> Result<(), RpcError>;
    /// Terminate the agent itself.
    async fn kill_sched(&self) -> Result<(), RpcError>;
}

/// One connection per worker agent, re-established on demand with bounded
/// retries.
pub struct SchedClient {
    addr: String,
    conn: Mutex<Option<TcpStream>>,
}

impl SchedClient {
    pub fn new(addr: impl Into<String>) -> Self {
        SchedClient {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<TcpStream, RpcError> {
        let backoff = Backoff::default();
        let mut last = RpcError::ConnectFailed(self.addr.clone());
        for _ in 0..RPC_CONNECT_TRIALS {
            match wire::connect(&self.addr, RPC_CONNECT_TIMEOUT).await {
                Ok(sock) => return Ok(sock),
                Err(e) => {
                    warn!("sched agent {}: {e}", self.addr);
                    last = e;
                }
            }
            sleep(backoff.duration()).await;
        }
        Err(last)
    }

    async fn call(&self, req: &SchedRequest) -> Result<(), RpcError> {
        let backoff = Backoff::default();
        let mut last = RpcError::ConnectFailed(self.addr.clone());
        for trial in 0..RPC_CALL_TRIALS {
            {
                let mut guard = self.conn.lock().await;
                if guard.is_none() {
                    match self.connect().await {
                        Ok(sock) => *guard = Some(sock),
                        Err(e) => {
                            last = e;
                            continue;
                        }
                    }
                }
                let sock = guard.as_mut().expect("connection just established");
                match wire::call::<_, RpcStatus>(sock, req, RPC_CALL_TIMEOUT).await {
                    Ok(status) if status.code == 0 => return Ok(()),
                    Ok(status) => {
                        last = RpcError::Status {
                            code: status.code,
                            errmsg: status.errmsg,
                        };
                    }
                    Err(e) => {
                        // The stream may hold half a frame; start over.
                        *guard = None;
                        last = e;
                    }
                }
            }
            debug!("sched agent {} trial {trial} failed: {last}", self.addr);
            sleep(backoff.duration()).await;
        }
        Err(last)
    }
}

#[async_trait]
impl ChainScheduler for SchedClient {
    async fn setup_chain(&self, tids: &[i32]) -> Result<(), RpcError> {
        self.call(&SchedRequest::SetupChain { tids: tids.to_vec() }).await
    }

    async fn remove_chain(&self, tids: &[i32]) -> Result<(), RpcError> {
        self.call(&SchedRequest::RemoveChain { tids: tids.to_vec() }).await
    }

    async fn attach_chain(&self, tids: &[i32], core: u32) -> Result<(), RpcError> {
        self.call(&SchedRequest::AttachChain {
            tids: tids.to_vec(),
            core,
        })
        .await
    }

    async fn detach_chain(&self, tids: &[i32], core: u32) -> Result<(), RpcError> {
        self.call(&SchedRequest::DetachChain {
            tids: tids.to_vec(),
            core,
        })
        .await
    }

    async fn kill_sched(&self) -> Result<(), RpcError> {
        self.call(&SchedRequest::KillSched).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn attach_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let req: SchedRequest = wire::recv_msg(&mut sock).await.unwrap();
            match req {
                SchedRequest::AttachChain { tids, core } => {
                    assert_eq!(tids, vec![11, 12]);
                    assert_eq!(core, 3);
                }
                other => panic!("unexpected request {other:?}"),
            }
            wire::send_msg(&mut sock, &RpcStatus::ok()).await.unwrap();
        });

        let client = SchedClient::new(addr);
        client.attach_chain(&[11, 12], 3).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_status_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                while let Ok(_req) = wire::recv_msg::<SchedRequest>(&mut sock).await {
                    wire::send_msg(&mut sock, &RpcStatus::err("no such chain"))
                        .await
                        .unwrap();
                }
            }
        });

        let client = SchedClient::new(addr);
        let got = client.detach_chain(&[7], 0).await;
        assert!(matches!(got, Err(RpcError::Status { code: 1, .. })));
    }
}
