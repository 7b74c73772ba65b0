//! Active/active replication between the two servers of a uri.
//!
//! Each server holds one outbound bus client toward its peer. Pairing races
//! resolve through `connect_other_server`: the receiver drops whatever link
//! it had and redials the sender. Chat indices are agreed through the
//! `sync_next_index` round trip; both sides apply `max(local, incoming) + 1`,
//! so the counters converge on the same sequence.

use super::middleware::{Handled, Middleware};
use super::ServerState;
use crate::bus::{BusClient, ACK_TIMEOUT};
use crate::error::{Error, Result};
use crate::ns;
use crate::wire::{payload_str, payload_u64, Payload};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct ReplicationMiddleware {
    state: Arc<ServerState>,
    replica: Mutex<Option<Arc<BusClient>>>,
    next_index: Mutex<u64>,
}

impl ReplicationMiddleware {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            replica: Mutex::new(None),
            next_index: Mutex::new(0),
        }
    }

    /// Ask the name server for our peer and dial it. Called once at boot;
    /// afterwards pairing is event-driven (`connect_other_server`).
    pub async fn pair(&self) {
        let cfg = &self.state.cfg;
        let peer = match ns::client::replica_addr(cfg.ns_addr, &cfg.uri, &self.state.addr).await {
            Ok(Some(addr)) => addr,
            Ok(None) => return,
            Err(e) => {
                warn!("replica lookup failed: {}", e);
                return;
            }
        };

        info!("connecting to replica {}", peer);
        match self.dial(&peer).await {
            Ok(client) => {
                // Tell the peer to adopt us as its replica link.
                let _ = client
                    .emit(
                        "connect_other_server",
                        json!({"replica_addr": self.state.addr}),
                    )
                    .await;
                *self.replica.lock().await = Some(client);
            }
            Err(e) => warn!("replica dial to {} failed: {}", peer, e),
        }
    }

    async fn dial(&self, addr: &str) -> Result<Arc<BusClient>> {
        let mut auth = Payload::new();
        auth.insert("replica_addr".into(), json!(self.state.addr));
        let (client, _events) = BusClient::connect(addr, auth).await?;
        Ok(Arc::new(client))
    }

    async fn link(&self) -> Option<Arc<BusClient>> {
        self.replica.lock().await.clone()
    }

    pub async fn drop_link(&self) {
        if let Some(client) = self.replica.lock().await.take() {
            client.close();
        }
    }

    pub async fn has_replica(&self) -> bool {
        self.replica.lock().await.is_some()
    }

    /// Fire-and-forget toward the replica; failures drop the link.
    async fn forward(&self, event: &str, payload: Value) {
        let Some(link) = self.link().await else {
            return;
        };
        if let Err(e) = link.emit(event, payload).await {
            warn!("forwarding {} to replica failed: {}", event, e);
            self.drop_link().await;
        }
    }

    async fn on_connect(&self, sid: &str, data: &mut Payload) -> Result<Handled> {
        if data.contains_key("replica_addr") {
            // The peer server's inbound link; not a user.
            debug!("replica link accepted from {}", sid);
            return Ok(Handled::Stop(Payload::new()));
        }
        if data.contains_key("username") {
            let mut synced = data.clone();
            synced.insert("sid".into(), json!(sid));
            synced.insert("replicated".into(), json!(true));
            self.forward("sync_new_user", Value::Object(synced)).await;
        }
        Ok(Handled::Continue(Payload::new()))
    }

    async fn on_connect_other(&self, data: &mut Payload) -> Result<Handled> {
        let Some(addr) = payload_str(data, "replica_addr").map(str::to_string) else {
            return Err(Error::Malformed("connect_other_server without addr".into()));
        };
        self.drop_link().await;
        match self.dial(&addr).await {
            Ok(client) => {
                info!("replica link switched to {}", addr);
                *self.replica.lock().await = Some(client);
            }
            Err(e) => warn!("redial to {} failed: {}", addr, e),
        }
        Ok(Handled::Continue(Payload::new()))
    }

    async fn on_sync_new_user(&self, data: &mut Payload) -> Result<Handled> {
        let name = payload_str(data, "username").unwrap_or_default().to_string();
        let remote_sid = payload_str(data, "sid").unwrap_or_default().to_string();
        let uri = payload_str(data, "publicUri").unwrap_or_default().to_string();
        match self.state.users.add_user(&name, &remote_sid, &uri, true).await {
            Ok(user) => debug!("synced user {} from replica", user.name),
            Err(e) => debug!("sync_new_user skipped: {}", e),
        }
        Ok(Handled::Stop(Payload::new()))
    }

    async fn on_disconnect(&self, sid: &str) -> Result<Handled> {
        if let Some(user) = self.state.users.by_sid(sid).await {
            if !user.replicated && !user.disconnected {
                self.forward("disconnect_synced_user", json!({"sid": sid}))
                    .await;
            }
        }
        Ok(Handled::Continue(Payload::new()))
    }

    /// Reserve an index for the peer's message. Both counters move past the
    /// reserved value, and the reply tells the peer what to stamp.
    async fn on_sync_next_index(&self, data: &mut Payload) -> Result<Handled> {
        let incoming = payload_u64(data, "message_index")
            .ok_or_else(|| Error::Malformed("sync_next_index without index".into()))?;

        let reserved = {
            let mut next = self.next_index.lock().await;
            let reserved = (*next).max(incoming);
            *next = reserved + 1;
            reserved
        };
        data.insert("message_index".into(), json!(reserved));

        let mut reply = Payload::new();
        reply.insert("next_index".into(), json!(reserved));
        Ok(Handled::Continue(reply))
    }

    /// Stamp an index onto a locally-received chat, agreeing with the
    /// replica when one is connected.
    async fn on_chat(&self, sid: &str, data: &mut Payload) -> Result<Handled> {
        if !data.contains_key("client_name") {
            let Some(user) = self.state.users.by_sid(sid).await else {
                debug!("chat from unknown session {}", sid);
                return Ok(Handled::Stop(Payload::new()));
            };
            data.insert("client_name".into(), json!(user.name));
        }

        let link = self.link().await;
        match link {
            Some(link) => {
                let proposed = {
                    let next = self.next_index.lock().await;
                    *next
                };
                data.insert("message_index".into(), json!(proposed));

                // Counter lock is NOT held across the round trip; the ack is
                // what synchronizes the two counters.
                match link
                    .emit_with_ack("sync_next_index", Value::Object(data.clone()), ACK_TIMEOUT)
                    .await
                {
                    Ok(reply) => {
                        let reserved = payload_u64(&reply, "next_index").unwrap_or(proposed);
                        let mut next = self.next_index.lock().await;
                        *next = (*next).max(reserved) + 1;
                        drop(next);
                        data.insert("message_index".into(), json!(reserved));
                    }
                    Err(e) if e.is_peer_failure() => {
                        warn!("replica lost while indexing: {}", e);
                        self.drop_link().await;
                        let mut next = self.next_index.lock().await;
                        data.insert("message_index".into(), json!(*next));
                        *next += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            None => {
                let mut next = self.next_index.lock().await;
                data.insert("message_index".into(), json!(*next));
                *next += 1;
            }
        }

        Ok(Handled::Continue(Payload::new()))
    }
}

#[async_trait]
impl Middleware for ReplicationMiddleware {
    fn name(&self) -> &'static str {
        "replication"
    }

    fn events(&self) -> &'static [&'static str] {
        &[
            "connect",
            "disconnect",
            "chat",
            "sync_next_index",
            "connect_other_server",
            "sync_new_user",
            "update_p2p_uri",
        ]
    }

    async fn handle(&self, event: &str, sid: &str, data: &mut Payload) -> Result<Handled> {
        match event {
            "connect" => self.on_connect(sid, data).await,
            "disconnect" => self.on_disconnect(sid).await,
            "chat" => self.on_chat(sid, data).await,
            "sync_next_index" => self.on_sync_next_index(data).await,
            "connect_other_server" => self.on_connect_other(data).await,
            "sync_new_user" => self.on_sync_new_user(data).await,
            "update_p2p_uri" => {
                let mut forwarded = data.clone();
                forwarded.insert("sid".into(), json!(sid));
                self.forward("update_p2p_uri_replica", Value::Object(forwarded))
                    .await;
                Ok(Handled::Continue(Payload::new()))
            }
            _ => Ok(Handled::Continue(Payload::new())),
        }
    }
}
