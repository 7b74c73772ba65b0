//! Peer-address lookups for client side channels.

use super::middleware::{Handled, Middleware};
use super::ServerState;
use crate::error::Result;
use crate::wire::{payload_str, Payload};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Answers `addr_request` with the published peer endpoint and uuid of a
/// user, so clients can open direct side channels.
pub struct P2pMiddleware {
    state: Arc<ServerState>,
}

impl P2pMiddleware {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Middleware for P2pMiddleware {
    fn name(&self) -> &'static str {
        "p2p"
    }

    fn events(&self) -> &'static [&'static str] {
        &["addr_request"]
    }

    async fn handle(&self, _event: &str, _sid: &str, data: &mut Payload) -> Result<Handled> {
        let user = match payload_str(data, "username") {
            Some(name) => self.state.users.by_name(name).await,
            None => None,
        };

        let mut reply = Payload::new();
        match user {
            Some(user) => {
                reply.insert("uri".into(), json!(user.uri));
                reply.insert("uuid".into(), json!(user.uuid));
            }
            None => {
                reply.insert("uri".into(), Value::Null);
                reply.insert("uuid".into(), Value::Null);
            }
        }
        Ok(Handled::Stop(reply))
    }
}
