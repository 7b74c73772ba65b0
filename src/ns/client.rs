//! Outbound name-server calls used by servers and clients.

use super::proto::{NsRequest, NsResponse};
use crate::error::{Error, Result};
use crate::wire;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

async fn call(ns: SocketAddr, request: NsRequest) -> Result<NsResponse> {
    let mut stream = TcpStream::connect(ns).await?;
    wire::write_frame(&mut stream, &request).await?;
    wire::read_frame(&mut stream)
        .await?
        .ok_or_else(|| Error::PeerUnreachable(format!("name server {ns} closed early")))
}

/// Register `addr` for `uri`. Returns whether the name server granted an
/// active slot.
pub async fn register_server(ns: SocketAddr, uri: &str, addr: &str) -> Result<bool> {
    let reply = call(
        ns,
        NsRequest::UpdateServer {
            uri: uri.to_string(),
            addr: addr.to_string(),
        },
    )
    .await?;
    match reply {
        NsResponse::UpdateServerResponse { active_server, .. } => Ok(active_server),
        other => Err(Error::Malformed(format!("unexpected reply {other:?}"))),
    }
}

/// Resolve `uri` to the closest active server, or a lookup miss.
pub async fn resolve_addr(ns: SocketAddr, uri: &str) -> Result<String> {
    let reply = call(
        ns,
        NsRequest::AddrRequest {
            uri: uri.to_string(),
        },
    )
    .await?;
    match reply {
        NsResponse::AddrResponse {
            addr: Some(addr),
            status: 200,
            ..
        } => Ok(addr),
        NsResponse::AddrResponse { req_uri, .. } => {
            Err(Error::LookupMiss(format!("no active server for {req_uri}")))
        }
        other => Err(Error::Malformed(format!("unexpected reply {other:?}"))),
    }
}

/// Any known-but-inactive server for `uri`.
pub async fn random_server(ns: SocketAddr, uri: &str) -> Result<Option<String>> {
    let reply = call(
        ns,
        NsRequest::GetRandomServer {
            uri: uri.to_string(),
        },
    )
    .await?;
    match reply {
        NsResponse::RandomServerResponse { addr } => Ok(addr),
        other => Err(Error::Malformed(format!("unexpected reply {other:?}"))),
    }
}

/// Swap this server's active slot over to `new_addr` (migration handoff).
pub async fn set_current_server(
    ns: SocketAddr,
    uri: &str,
    new_addr: &str,
    self_addr: &str,
) -> Result<()> {
    let reply = call(
        ns,
        NsRequest::SetCurrentServer {
            uri: uri.to_string(),
            addr: new_addr.to_string(),
            self_addr: self_addr.to_string(),
        },
    )
    .await?;
    match reply {
        NsResponse::SetCurrentServerResponse {} => Ok(()),
        other => Err(Error::Malformed(format!("unexpected reply {other:?}"))),
    }
}

/// The other active address for `uri`, or None when unpaired.
pub async fn replica_addr(ns: SocketAddr, uri: &str, my_addr: &str) -> Result<Option<String>> {
    let reply = call(
        ns,
        NsRequest::GetReplicaAddr {
            uri: uri.to_string(),
            my_addr: my_addr.to_string(),
        },
    )
    .await?;
    match reply {
        NsResponse::GetReplicaAddrResponse { addr } if addr.is_empty() => {
            debug!("no replica yet for {}", uri);
            Ok(None)
        }
        NsResponse::GetReplicaAddrResponse { addr } => Ok(Some(addr)),
        other => Err(Error::Malformed(format!("unexpected reply {other:?}"))),
    }
}
