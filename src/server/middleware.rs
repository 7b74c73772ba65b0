//! Middleware pipeline.
//!
//! Every server event walks a fixed chain of layers. A layer either lets the
//! event continue down the chain or stops it; replies accumulate with later
//! layers overriding earlier ones, and the merged map becomes the event's
//! acknowledgement.

use crate::error::Result;
use crate::wire::{merge_payload, Payload};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome of one layer's handler: the reply so far, and whether the event
/// keeps moving down the chain.
pub enum Handled {
    Continue(Payload),
    Stop(Payload),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event names this layer handles. Events outside the list pass through
    /// untouched.
    fn events(&self) -> &'static [&'static str];

    /// Handle one event. `data` is shared down the chain, so layers may
    /// annotate it for their successors.
    async fn handle(&self, event: &str, sid: &str, data: &mut Payload) -> Result<Handled>;
}

pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(layers: Vec<Arc<dyn Middleware>>) -> Self {
        Self { layers }
    }

    /// Union of handled event names, minus the transport-level pair that is
    /// always delivered to the head of the chain.
    pub fn event_union(&self) -> HashSet<String> {
        self.layers
            .iter()
            .flat_map(|l| l.events().iter())
            .filter(|e| **e != "connect" && **e != "disconnect")
            .map(|e| e.to_string())
            .collect()
    }

    /// Route an event through the chain, returning the merged reply.
    pub async fn dispatch(&self, event: &str, sid: &str, data: &mut Payload) -> Result<Payload> {
        let mut reply = Payload::new();
        for layer in &self.layers {
            if !layer.events().iter().any(|e| *e == event) {
                continue;
            }
            match layer.handle(event, sid, data).await? {
                Handled::Continue(part) => merge_payload(&mut reply, part),
                Handled::Stop(part) => {
                    merge_payload(&mut reply, part);
                    break;
                }
            }
        }
        Ok(reply)
    }
}
