//! Bidirectional event bus over TCP.
//!
//! A connection opens with an `auth` frame; the accepting side answers with
//! an ack carrying `connected: true` (plus any handler reply fields) or
//! `connected: false` with a `reason` string. After that, both sides
//! exchange named events, optionally tagged with a `seq` when the sender
//! wants an acknowledgement.
//!
//! The server half hands inbound traffic to the application as [`BusEvent`]s
//! over an mpsc channel; the application decides what each event means.

mod client;
mod server;

pub use client::{BusClient, ClientEvent};
pub use server::{BusEvent, BusServer, Responder};

use std::time::Duration;

/// Default wait for an emit-with-ack round trip.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a migration target may take to acknowledge the state transfer.
pub const MIGRATE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the per-connection outbound frame queue.
pub(crate) const FRAME_QUEUE: usize = 64;

/// Capacity of the inbound application event queue.
pub(crate) const EVENT_QUEUE: usize = 256;
