//! Chat proper: user admission, the message log, history, and broadcasts.

use super::middleware::{Handled, Middleware};
use super::ServerState;
use crate::bus::BusServer;
use crate::error::{Error, Result};
use crate::types::MessageBody;
use crate::wire::{payload_flag, payload_str, payload_u64, Payload};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ChatMiddleware {
    state: Arc<ServerState>,
    bus: Arc<BusServer>,
}

impl ChatMiddleware {
    pub fn new(state: Arc<ServerState>, bus: Arc<BusServer>) -> Self {
        Self { state, bus }
    }

    /// Snapshot of the log as `[[index, {username, message}], ...]`, sorted.
    async fn history(&self) -> Value {
        let messages = self.state.messages.lock().await;
        let entries: Vec<Value> = messages
            .iter()
            .map(|(index, body)| json!([index, body]))
            .collect();
        Value::Array(entries)
    }

    /// History and live chat only flow once enough users have shown up, or
    /// once the backlog has been flushed for good.
    async fn gate_open(&self) -> bool {
        let min = self.state.min_user_count.load(Ordering::SeqCst);
        self.state.users.live_count().await >= min
    }

    async fn on_connect(&self, sid: &str, data: &mut Payload) -> Result<Handled> {
        let username = payload_str(data, "username")
            .map(str::to_string)
            .ok_or_else(|| Error::ConnectionRefused("auth without username".into()))?;
        let uri = payload_str(data, "publicUri").unwrap_or_default().to_string();
        let replicated = payload_flag(data, "replicated");
        let reconnecting = payload_flag(data, "reconnecting");

        let user = self
            .state
            .users
            .add_user(&username, sid, &uri, replicated)
            .await
            .map_err(|e| Error::ConnectionRefused(e.to_string()))?;
        debug!("{} connected with sid {}", user.name, sid);

        if !replicated {
            if !reconnecting {
                self.bus
                    .broadcast(
                        "server_message",
                        json!({"message": format!("\u{2713} {username} has connected to the server")}),
                    )
                    .await;
            }
            if let Err(e) = self.bus.emit(sid, "send_uuid", json!(user.uuid)).await {
                warn!("send_uuid to {} failed: {}", sid, e);
            }
        }

        if self.gate_open().await && !reconnecting {
            let history = json!({ "messages": self.history().await });
            if self.state.history_sent.load(Ordering::SeqCst) {
                // Everyone else already has the backlog.
                if let Err(e) = self.bus.emit(sid, "message_history", history).await {
                    warn!("history to {} failed: {}", sid, e);
                }
            } else {
                self.bus.broadcast("message_history", history).await;
                self.state.history_sent.store(true, Ordering::SeqCst);
            }
        }

        Ok(Handled::Continue(Payload::new()))
    }

    async fn on_disconnect(&self, sid: &str) -> Result<Handled> {
        if let Some(user) = self.state.users.tombstone(sid).await {
            debug!("user disconnected: {}", user.name);
            if !user.replicated {
                self.bus
                    .broadcast(
                        "server_message",
                        json!({"message": format!("\u{274C} {} has disconnected from the server", user.name)}),
                    )
                    .await;
            }
        }
        Ok(Handled::Continue(Payload::new()))
    }

    /// Append an indexed message and fan it out to every reachable session.
    async fn on_chat(&self, data: &mut Payload) -> Result<Handled> {
        let username = payload_str(data, "client_name")
            .ok_or_else(|| Error::Malformed("chat without client_name".into()))?
            .to_string();
        let index = payload_u64(data, "message_index")
            .ok_or_else(|| Error::Malformed("chat without message_index".into()))?;
        let message = payload_str(data, "message").unwrap_or_default().to_string();

        self.state.messages.lock().await.insert(
            index,
            MessageBody {
                username: username.clone(),
                message: message.clone(),
            },
        );

        if self.gate_open().await || self.state.history_sent.load(Ordering::SeqCst) {
            let outgoing = json!({
                "username": username,
                "message": message,
                "index": index,
            });
            for user in self.state.users.live_users().await {
                if let Err(e) = self.bus.emit(&user.sid, "chat", outgoing.clone()).await {
                    debug!("chat to {} failed: {}", user.sid, e);
                }
            }
        }

        Ok(Handled::Continue(Payload::new()))
    }

    async fn on_update_uri(&self, sid: &str, data: &mut Payload) -> Result<Handled> {
        let username = payload_str(data, "username")
            .ok_or_else(|| Error::Malformed("uri update without username".into()))?;
        let uri = payload_str(data, "uri").unwrap_or_default().to_string();
        // The replica-forwarded variant carries the origin server's sid.
        let bind_sid = payload_str(data, "sid").unwrap_or(sid).to_string();

        if self
            .state
            .users
            .rebind_uri(username, &bind_sid, &uri)
            .await
            .is_none()
        {
            debug!("uri update for unknown user {}", username);
        }
        Ok(Handled::Continue(Payload::new()))
    }

    async fn on_disconnect_synced(&self, data: &mut Payload) -> Result<Handled> {
        if let Some(remote_sid) = payload_str(data, "sid") {
            self.state.users.tombstone(remote_sid).await;
        }
        Ok(Handled::Stop(Payload::new()))
    }
}

#[async_trait]
impl Middleware for ChatMiddleware {
    fn name(&self) -> &'static str {
        "chat"
    }

    fn events(&self) -> &'static [&'static str] {
        &[
            "connect",
            "disconnect",
            "chat",
            "sync_next_index",
            "update_p2p_uri",
            "update_p2p_uri_replica",
            "disconnect_synced_user",
        ]
    }

    async fn handle(&self, event: &str, sid: &str, data: &mut Payload) -> Result<Handled> {
        match event {
            "connect" => self.on_connect(sid, data).await,
            "disconnect" => self.on_disconnect(sid).await,
            "chat" | "sync_next_index" => self.on_chat(data).await,
            "update_p2p_uri" | "update_p2p_uri_replica" => self.on_update_uri(sid, data).await,
            "disconnect_synced_user" => self.on_disconnect_synced(data).await,
            _ => Ok(Handled::Continue(Payload::new())),
        }
    }
}
