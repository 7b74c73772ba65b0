//! Name-server liveness probes.

use super::middleware::{Handled, Middleware};
use super::ServerState;
use crate::error::Result;
use crate::wire::{payload_flag, Payload};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Recognizes the name server's `{dns_polling: true}` connections and keeps
/// their session ids so shutdown can say goodbye over them.
pub struct DnsMiddleware {
    state: Arc<ServerState>,
}

impl DnsMiddleware {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Middleware for DnsMiddleware {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn events(&self) -> &'static [&'static str] {
        &["connect", "disconnect"]
    }

    async fn handle(&self, event: &str, sid: &str, data: &mut Payload) -> Result<Handled> {
        match event {
            "connect" if payload_flag(data, "dns_polling") => {
                debug!("name server polling link established");
                self.state.dns_sessions.lock().await.insert(sid.to_string());
                let mut reply = Payload::new();
                reply.insert("status".into(), json!("OK"));
                Ok(Handled::Stop(reply))
            }
            "disconnect" => {
                self.state.dns_sessions.lock().await.remove(sid);
                Ok(Handled::Continue(Payload::new()))
            }
            _ => Ok(Handled::Continue(Payload::new())),
        }
    }
}
