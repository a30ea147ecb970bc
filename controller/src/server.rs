// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The controller's control-plane server. The ingress switch reports new
//! flows and port changes here; instances report thread ids and telemetry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use faas_rpc::wire::{self, RpcError};
use faas_rpc::{CtrlRequest, CtrlResponse, FlowTableEntry, RpcStatus};

use crate::faas::FaasController;
use crate::flowlet::FiveTuple;

/// Accept loop; one task per connection.
pub async fn serve(controller: Arc<FaasController>, listener: TcpListener) {
    match listener.local_addr() {
        Ok(addr) => info!("control server listening on {addr}"),
        Err(e) => warn!("control server listening on unknown address: {e}"),
    }
    loop {
        match listener.accept().await {
            Ok((sock, peer)) => {
                let controller = controller.clone();
                tokio::spawn(handle_conn(controller, sock, peer));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_conn(controller: Arc<FaasController>, mut sock: TcpStream, peer: SocketAddr) {
    debug!("control connection from {peer}");
    loop {
        let request: CtrlRequest = match wire::recv_msg(&mut sock).await {
            Ok(request) => request,
            Err(RpcError::PeerLeft) => break,
            Err(e) => {
                warn!("control connection from {peer}: {e}");
                break;
            }
        };
        let response = dispatch(&controller, request).await;
        if let Err(e) = wire::send_msg(&mut sock, &response).await {
            warn!("control connection to {peer}: {e}");
            break;
        }
    }
    debug!("control connection from {peer} closed");
}

async fn dispatch(controller: &Arc<FaasController>, request: CtrlRequest) -> CtrlResponse {
    match request {
        CtrlRequest::UpdateFlow(flow) => {
            let flow = FiveTuple::from(&flow);
            match controller.update_flow(&flow).await {
                Ok(entry) => CtrlResponse::FlowTableEntry(entry),
                Err(e) => {
                    debug!("flow {flow} not served: {e}");
                    CtrlResponse::FlowTableEntry(FlowTableEntry::none())
                }
            }
        }
        CtrlRequest::UpdatePort { ports } => CtrlResponse::AffectedSGroups {
            sgroups: controller.update_port(&ports).await,
        },
        CtrlRequest::InstanceSetUp {
            node_name,
            port,
            tid,
        } => match controller.instance_set_up(&node_name, port, tid).await {
            Ok(()) => CtrlResponse::Status(RpcStatus::ok()),
            Err(e) => CtrlResponse::Status(RpcStatus::err(e.to_string())),
        },
        CtrlRequest::InstanceUpdateStats {
            node_name,
            port,
            queue_length,
            rate_kpps,
            cycles_per_packet,
        } => match controller
            .instance_update_stats(&node_name, port, queue_length, rate_kpps, cycles_per_packet)
            .await
        {
            Ok(()) => CtrlResponse::Status(RpcStatus::ok()),
            Err(e) => CtrlResponse::Status(RpcStatus::err(e.to_string())),
        },
    }
}
