//! Name server: resolution, registration, replica pairing, liveness.
//!
//! Listens on a stream socket; each accepted connection carries one framed
//! request and receives one reply. After activating a server the name server
//! dials the server's event bus with `{dns_polling: true}` and evicts the
//! address when that link drops.

pub mod client;
pub mod proto;
pub mod proximity;
pub mod registry;

pub use proto::{NsRequest, NsResponse};
pub use proximity::find_closest_ip;
pub use registry::Registry;

use crate::bus::BusClient;
use crate::error::Result;
use crate::wire::{self, Payload};
use proto::{NsRequest as Req, NsResponse as Resp};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct NameServer {
    registry: Arc<Registry>,
    listener: TcpListener,
}

impl NameServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("name server up on {}", listener.local_addr()?);
        Ok(Self {
            registry: Arc::new(Registry::new()),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accept loop. Each connection is served on its own task.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(registry, stream, peer).await {
                    debug!("connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

async fn serve_connection(
    registry: Arc<Registry>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let request: Req = match wire::read_frame(&mut stream).await {
        Ok(Some(req)) => req,
        Ok(None) => return Ok(()),
        Err(e) => {
            // Malformed requests are skipped without a reply.
            debug!("malformed request from {}: {}", peer, e);
            return Ok(());
        }
    };

    debug!("{} -> {:?}", peer, request);
    match request {
        Req::UpdateServer { uri, addr } => {
            let active = registry.register(&uri, &addr).await;
            let reply = Resp::UpdateServerResponse {
                addr: addr.clone(),
                active_server: active,
            };
            wire::write_frame(&mut stream, &reply).await?;
            info!("registered {} for {} (active: {})", addr, uri, active);

            if active {
                tokio::spawn(watch_server(registry, uri, addr));
            }
        }
        Req::AddrRequest { uri } => {
            let addr = registry.closest(peer.ip(), &uri).await;
            let status = if addr.is_some() { 200 } else { 404 };
            let reply = Resp::AddrResponse {
                req_uri: uri.clone(),
                addr: addr.clone(),
                status,
            };
            wire::write_frame(&mut stream, &reply).await?;
            debug!("resolved {} -> {:?} for {}", uri, addr, peer);
        }
        Req::GetRandomServer { uri } => {
            let reply = Resp::RandomServerResponse {
                addr: registry.random_inactive(&uri).await,
            };
            wire::write_frame(&mut stream, &reply).await?;
        }
        Req::SetCurrentServer {
            uri,
            addr,
            self_addr,
        } => {
            registry.swap_active(&uri, &addr, &self_addr).await;
            wire::write_frame(&mut stream, &Resp::SetCurrentServerResponse {}).await?;
        }
        Req::GetReplicaAddr { uri, my_addr } => {
            let reply = Resp::GetReplicaAddrResponse {
                addr: registry.replica_of(&uri, &my_addr).await.unwrap_or_default(),
            };
            wire::write_frame(&mut stream, &reply).await?;
        }
    }
    Ok(())
}

/// Liveness watcher for one newly-activated server. Dial failures drop the
/// address immediately; no retries.
async fn watch_server(registry: Arc<Registry>, uri: String, addr: String) {
    let mut auth = Payload::new();
    auth.insert("dns_polling".into(), Value::Bool(true));

    let (client, mut events) = match BusClient::connect(&addr, auth).await {
        Ok(link) => link,
        Err(e) => {
            warn!("liveness dial to {} failed: {}", addr, e);
            registry.remove(&uri, &addr).await;
            return;
        }
    };

    loop {
        match events.recv().await {
            Some(event) if event.name == "server_down_dns" => {
                // The server is going quiet on purpose; close our side.
                info!("{} signalled shutdown", addr);
                break;
            }
            Some(_) => {}
            None => {
                info!("{} dropped its liveness link", addr);
                break;
            }
        }
    }

    registry.remove(&uri, &addr).await;
    client.close();
}
