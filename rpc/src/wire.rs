// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Length-prefixed bincode framing over TCP.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("failed to connect to {0}")]
    ConnectFailed(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("peer closed the connection")]
    PeerLeft,

    #[error("send failure: {0}")]
    Tx(String),

    #[error("receive failure: {0}")]
    Rx(String),

    #[error("oversized frame ({0} octets)")]
    Oversized(usize),

    #[error("message encoding failed")]
    Encode,

    #[error("message decoding failed")]
    Decode,

    #[error("remote returned status {code}: {errmsg}")]
    Status { code: i32, errmsg: String },

    #[error("unexpected response type")]
    UnexpectedResponse,

    #[error("redis error: {0}")]
    Redis(String),
}

/// Connect to `addr`, failing if the connection does not come up within
/// the indicated timeout.
pub async fn connect(addr: &str, tout: Duration) -> Result<TcpStream, RpcError> {
    let sock = timeout(tout, TcpStream::connect(addr))
        .await
        .map_err(|_| RpcError::Timeout(tout))?
        .map_err(|_| RpcError::ConnectFailed(addr.to_string()))?;
    sock.set_nodelay(true)
        .map_err(|e| RpcError::ConnectFailed(format!("{addr}: {e}")))?;
    debug!("connected to {addr}");
    Ok(sock)
}

/// Send one framed message.
pub async fn send_msg<T: Serialize>(sock: &mut TcpStream, msg: &T) -> Result<(), RpcError> {
    let payload = bincode2::serialize(msg).map_err(|_| RpcError::Encode)?;
    if payload.len() > MAX_FRAME {
        return Err(RpcError::Oversized(payload.len()));
    }
    let len = payload.len() as u32;
    sock.write_all(&len.to_be_bytes())
        .await
        .map_err(|e| RpcError::Tx(e.to_string()))?;
    sock.write_all(&payload)
        .await
        .map_err(|e| RpcError::Tx(e.to_string()))?;
    Ok(())
}

/// Receive one framed message, blocking until a complete frame arrives.
pub async fn recv_msg<T: DeserializeOwned>(sock: &mut TcpStream) -> Result<T, RpcError> {
    let mut len_buf = [0u8; 4];
    sock.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RpcError::PeerLeft
        } else {
            RpcError::Rx(e.to_string())
        }
    })?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(RpcError::Oversized(len));
    }

    let mut payload = vec![0u8; len];
    sock.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RpcError::PeerLeft
        } else {
            RpcError::Rx(e.to_string())
        }
    })?;
    bincode2::deserialize(&payload).map_err(|_| RpcError::Decode)
}

/// Receive one framed message with a deadline.
pub async fn recv_msg_timed<T: DeserializeOwned>(
    sock: &mut TcpStream,
    tout: Duration,
) -> Result<T, RpcError> {
    timeout(tout, recv_msg(sock))
        .await
        .map_err(|_| RpcError::Timeout(tout))?
}

/// One request/response round trip with a response deadline.
pub async fn call<Req, Resp>(
    sock: &mut TcpStream,
    req: &Req,
    tout: Duration,
) -> Result<Resp, RpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    send_msg(sock, req).await?;
    recv_msg_timed(sock, tout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{FlowInfo, FlowTableEntry};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let flow: FlowInfo = recv_msg(&mut sock).await.unwrap();
            assert_eq!(flow.tcp_dport, 8080);
            let entry = FlowTableEntry {
                switch_port: 1,
                dmac: "00:00:00:00:00:01".into(),
            };
            send_msg(&mut sock, &entry).await.unwrap();
        });

        let mut sock = connect(&addr, Duration::from_secs(1)).await.unwrap();
        let flow = FlowInfo {
            ipv4_src: "1.1.1.1".into(),
            ipv4_dst: "2.2.2.2".into(),
            tcp_sport: 1000,
            tcp_dport: 8080,
            ipv4_protocol: 6,
        };
        let entry: FlowTableEntry = call(&mut sock, &flow, Duration::from_secs(1)).await.unwrap();
        assert_eq!(entry.switch_port, 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn peer_departure_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            drop(sock);
        });

        let mut sock = connect(&addr, Duration::from_secs(1)).await.unwrap();
        server.await.unwrap();
        let got = recv_msg::<FlowTableEntry>(&mut sock).await;
        assert!(matches!(got, Err(RpcError::PeerLeft)));
    }
}
