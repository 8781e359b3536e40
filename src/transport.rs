//! Network transport: a length-prefixed JSON frame over TCP, the same shape
//! as the teacher's `send_raft_message`/`handle_raft_message`, generalized
//! to carry an explicit sender id alongside the request/response body.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::ids::NodeId;
use crate::message::{Input, Output, RaftMessage, RaftRequest, RaftResponse};
use crate::node::NodeHandle;

#[derive(Debug, Serialize, Deserialize)]
struct WireRequest {
    from: NodeId,
    request: RaftRequest,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireResponse {
    response: RaftResponse,
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(value)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> anyhow::Result<T> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Connect to `addr`, send one request tagged with `from`, and return the
/// peer's response. One connection per RPC, same as the teacher's
/// `send_raft_message`.
pub async fn connect_and_send_request(addr: &str, from: NodeId, request: RaftRequest) -> anyhow::Result<RaftResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, &WireRequest { from, request }).await?;
    let wire: WireResponse = read_frame(&mut stream).await?;
    Ok(wire.response)
}

/// Listens for inbound Raft RPCs and feeds them to the node through its
/// `NodeHandle`, writing back whatever `AddressedResponse` the node
/// produces.
pub struct RaftServer {
    listener: TcpListener,
    handle: NodeHandle,
}

impl RaftServer {
    pub async fn bind(addr: &str, handle: NodeHandle) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(RaftServer { listener, handle })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let handle = self.handle.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, handle).await {
                    log::error!("raft connection from {peer_addr} failed: {e}");
                }
            });
        }
    }

    async fn handle_connection(mut stream: TcpStream, handle: NodeHandle) -> anyhow::Result<()> {
        let wire: WireRequest = read_frame(&mut stream).await?;
        let output = handle
            .request(Input::Message { from: wire.from, message: RaftMessage::Request(wire.request) })
            .await?;
        if let Output::AddressedResponse(_, response) = output {
            write_frame(&mut stream, &WireResponse { response }).await?;
        }
        Ok(())
    }
}

/// Drains a node's `Output` stream and turns `AddressedRequest`/
/// `AppendAccepted` into outbound connections, feeding whatever responses
/// come back back into the node as `Input::Message` responses. Mirrors the
/// teacher's per-peer `tokio::spawn` fan-out in `send_append_entries`.
pub async fn drive_outputs(
    mut outputs: tokio::sync::mpsc::UnboundedReceiver<Output>,
    handle: NodeHandle,
    self_id: NodeId,
    peer_addrs: HashMap<NodeId, String>,
) {
    while let Some(output) = outputs.recv().await {
        let requests = match output {
            Output::AddressedRequest(reqs) => reqs,
            Output::AppendAccepted { requests, .. } => requests,
            Output::AddressedResponse(..) | Output::NoOp(_) => continue,
        };
        for (peer, request) in requests {
            let Some(addr) = peer_addrs.get(&peer).cloned() else {
                log::warn!("no known address for peer {peer}, dropping request");
                continue;
            };
            let handle = handle.clone();
            let self_id = self_id.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(
                    std::time::Duration::from_millis(5000),
                    connect_and_send_request(&addr, self_id, request),
                )
                .await
                {
                    Ok(Ok(response)) => {
                        handle.notify(Input::Message { from: peer, message: RaftMessage::Response(response) });
                    }
                    Ok(Err(e)) => log::debug!("request to {peer} at {addr} failed: {e}"),
                    Err(_) => log::debug!("request to {peer} at {addr} timed out"),
                }
            });
        }
    }
}
