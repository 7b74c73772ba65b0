//! Live migration: electing a client host as the service's next home and
//! handing the chat state over to it.

use super::middleware::{Handled, Middleware};
use super::ServerState;
use crate::bus::{BusClient, BusServer, MIGRATE_ACK_TIMEOUT};
use crate::error::{Error, Result};
use crate::ns;
use crate::types::{format_addr, MessageBody};
use crate::wire::{payload_flag, payload_str, payload_u64, Payload};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a client gets to report its freshly-started server.
pub const SERVER_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between migration attempts.
pub const MIGRATION_CYCLE: Duration = Duration::from_secs(30);

pub struct MigrationMiddleware {
    state: Arc<ServerState>,
    bus: Arc<BusServer>,
}

impl MigrationMiddleware {
    pub fn new(state: Arc<ServerState>, bus: Arc<BusServer>) -> Self {
        Self { state, bus }
    }

    /// Background cycle: sleep, attempt a migration, repeat until one
    /// succeeds, then wake the shutdown path.
    pub async fn run_cycle(self: Arc<Self>) {
        loop {
            tokio::time::sleep(MIGRATION_CYCLE).await;
            debug!("cycle ended, initiating migration");
            match self.migrate().await {
                Ok(()) => {
                    info!("migration successful, retiring this server");
                    self.state.shutdown.notify_one();
                    break;
                }
                Err(e) => debug!("{}, repeating cycle", e),
            }
        }
    }

    /// One migration attempt. Success means the state now lives on the new
    /// server, the name-server pointer was swapped, and clients were told to
    /// reconnect; the process should exit.
    pub async fn migrate(&self) -> Result<()> {
        let (client, new_addr) = loop {
            let candidates = self.state.users.live_users().await;
            let Some(victim) = candidates.choose(&mut rand::thread_rng()).cloned() else {
                return Err(Error::MigrationAborted("no connected clients".into()));
            };

            let Some((ip, port)) = self.request_server_start(&victim.sid).await else {
                continue;
            };
            let new_addr = format_addr(ip, port);

            let mut auth = Payload::new();
            auth.insert("migration".into(), json!(true));
            match BusClient::connect(&new_addr, auth).await {
                Ok((client, _events)) => break (client, new_addr),
                Err(e) => {
                    warn!("migration target {} unreachable: {}", new_addr, e);
                    continue;
                }
            }
        };

        // From here on clients buffer locally until they see `reconnect`.
        self.set_paused(true).await;

        let transfer = {
            let messages = self.state.messages.lock().await;
            json!({
                "messages": &*messages,
                "min_user_count": self.state.min_user_count.load(Ordering::SeqCst),
                "history_sent": self.state.history_sent.load(Ordering::SeqCst),
            })
        };

        if let Err(e) = client
            .emit_with_ack("migrate", transfer, MIGRATE_ACK_TIMEOUT)
            .await
        {
            client.close();
            self.set_paused(false).await;
            return Err(Error::MigrationAborted(format!(
                "state transfer to {new_addr} failed: {e}"
            )));
        }
        client.close();

        let cfg = &self.state.cfg;
        if let Err(e) =
            ns::client::set_current_server(cfg.ns_addr, &cfg.uri, &new_addr, &self.state.addr)
                .await
        {
            // The new server holds a copy but was never activated; we stay
            // authoritative and retry next cycle.
            self.set_paused(false).await;
            return Err(Error::MigrationAborted(format!(
                "pointer swap failed: {e}"
            )));
        }

        info!("service for {} moved to {}", cfg.uri, new_addr);
        self.bus.broadcast("reconnect", Value::Null).await;
        Ok(())
    }

    async fn set_paused(&self, paused: bool) {
        self.state.migrating.store(paused, Ordering::SeqCst);
        self.bus.broadcast("pause_messaging", json!(paused)).await;
    }

    /// Ask one client to start a server process, waiting for the ack that
    /// carries the new `{ip, port}`.
    async fn request_server_start(&self, sid: &str) -> Option<(std::net::IpAddr, u16)> {
        debug!("requesting server start from {}", sid);
        let reply = match self
            .bus
            .emit_with_ack(sid, "server_start", json!({}), SERVER_START_TIMEOUT)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("server start via {} failed: {}", sid, e);
                return None;
            }
        };

        let ip = payload_str(&reply, "ip")?.parse().ok()?;
        let port = payload_u64(&reply, "port")? as u16;
        Some((ip, port))
    }

    /// Install the state arriving from the retiring server.
    async fn on_migrate(&self, data: &mut Payload) -> Result<Handled> {
        info!("receiving migrated state");
        let incoming: BTreeMap<u64, MessageBody> = data
            .remove("messages")
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();

        *self.state.messages.lock().await = incoming;
        if let Some(min) = payload_u64(data, "min_user_count") {
            self.state
                .min_user_count
                .store(min as usize, Ordering::SeqCst);
        }
        self.state
            .history_sent
            .store(payload_flag(data, "history_sent"), Ordering::SeqCst);

        Ok(Handled::Stop(Payload::new()))
    }

    fn on_connect(&self, data: &Payload) -> Result<Handled> {
        if payload_flag(data, "migration") {
            debug!("migration connection accepted");
            return Ok(Handled::Stop(Payload::new()));
        }
        if self.state.migrating.load(Ordering::SeqCst) {
            return Err(crate::error::Error::ConnectionRefused(
                "server is migrating".into(),
            ));
        }
        Ok(Handled::Continue(Payload::new()))
    }
}

#[async_trait]
impl Middleware for MigrationMiddleware {
    fn name(&self) -> &'static str {
        "migration"
    }

    fn events(&self) -> &'static [&'static str] {
        &["connect", "migrate"]
    }

    async fn handle(&self, event: &str, _sid: &str, data: &mut Payload) -> Result<Handled> {
        match event {
            "connect" => self.on_connect(data),
            "migrate" => self.on_migrate(data).await,
            _ => Ok(Handled::Continue(Payload::new())),
        }
    }
}
