//! Dialing side of the event bus.
//!
//! Used by chat clients, by servers dialing their replica or a migration
//! target, and by the name server's liveness probes.

use super::{EVENT_QUEUE, FRAME_QUEUE};
use crate::error::{Error, Result};
use crate::types::parse_addr;
use crate::wire::{self, Frame, Payload};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// A server-initiated event delivered to this client. When `seq` is present
/// the server expects an answer through [`BusClient::respond`].
#[derive(Debug)]
pub struct ClientEvent {
    pub name: String,
    pub seq: Option<u64>,
    pub payload: Value,
}

/// One established bus connection. Dropping the receiver returned by
/// [`BusClient::connect`] does not close the link; [`BusClient::close`] does.
pub struct BusClient {
    addr: String,
    tx: mpsc::Sender<Frame>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_seq: AtomicU64,
    alive: Arc<AtomicBool>,
    closed: Arc<Notify>,
    reader_task: JoinHandle<()>,
}

impl BusClient {
    /// Dial `addr` (`http://IP:PORT`) and run the auth handshake. A refusal
    /// from the far side surfaces as [`Error::ConnectionRefused`].
    pub async fn connect(
        addr: &str,
        auth: Payload,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let stream = TcpStream::connect(parse_addr(addr)?).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        wire::write_frame(
            &mut write_half,
            &Frame::event_with_seq("auth", 0, Value::Object(auth)),
        )
        .await?;

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // The server may deliver events ahead of the auth ack (connect
        // handlers broadcast while the verdict is still in flight); park
        // those in the event queue and keep looking for the ack.
        let reply = loop {
            let frame: Frame = wire::read_frame(&mut read_half)
                .await?
                .ok_or_else(|| Error::ConnectionRefused("closed during handshake".into()))?;
            if frame.ack == Some(0) {
                break wire::payload_map(frame.payload)?;
            }
            if let Some(name) = frame.event {
                let _ = event_tx
                    .send(ClientEvent {
                        name,
                        seq: frame.seq,
                        payload: frame.payload,
                    })
                    .await;
            }
        };
        if !wire::payload_flag(&reply, "connected") {
            let reason = wire::payload_str(&reply, "reason")
                .unwrap_or("refused")
                .to_string();
            return Err(Error::ConnectionRefused(reason));
        }

        let closed = Arc::new(Notify::new());
        let writer_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            let mut rx = frame_rx;
            loop {
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = wire::write_frame(&mut write_half, &frame).await {
                                debug!("client write failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_closed.notified() => break,
                }
            }
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut write_half).await;
        });

        let alive = Arc::new(AtomicBool::new(true));
        let reader_alive = Arc::clone(&alive);
        let reader_pending = Arc::clone(&pending);
        let reader_task = tokio::spawn(async move {
            loop {
                let frame: Frame = match wire::read_frame(&mut read_half).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("client read ended: {}", e);
                        break;
                    }
                };
                if let Some(ack_seq) = frame.ack {
                    if let Some(waiter) = reader_pending.lock().await.remove(&ack_seq) {
                        let _ = waiter.send(frame.payload);
                    }
                    continue;
                }
                if let Some(name) = frame.event {
                    let event = ClientEvent {
                        name,
                        seq: frame.seq,
                        payload: frame.payload,
                    };
                    if event_tx.send(event).await.is_err() {
                        // Receiver gone; keep draining acks for emit_with_ack.
                        continue;
                    }
                }
            }
            // Reader gone means the link is down; wake every waiter.
            reader_alive.store(false, Ordering::SeqCst);
            reader_pending.lock().await.clear();
        });

        Ok((
            Self {
                addr: addr.to_string(),
                tx: frame_tx,
                pending,
                next_seq: AtomicU64::new(1),
                alive,
                closed,
                reader_task,
            },
            event_rx,
        ))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// True while the far side has not hung up.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Fire-and-forget emit.
    pub async fn emit(&self, event: &str, payload: Value) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::PeerUnreachable(format!(
                "link to {} closed",
                self.addr
            )));
        }
        self.tx
            .send(Frame::event(event, payload))
            .await
            .map_err(|_| Error::PeerUnreachable(format!("link to {} closed", self.addr)))
    }

    /// Emit and wait up to `timeout` for the server's ack.
    pub async fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Payload> {
        if !self.is_alive() {
            return Err(Error::PeerUnreachable(format!(
                "link to {} closed",
                self.addr
            )));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, ack_tx);

        if self
            .tx
            .send(Frame::event_with_seq(event, seq, payload))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&seq);
            return Err(Error::PeerUnreachable(format!(
                "link to {} closed",
                self.addr
            )));
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(value)) => wire::payload_map(value),
            Ok(Err(_)) => Err(Error::PeerUnreachable(format!(
                "link to {} closed",
                self.addr
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                Err(Error::AckTimeout(event.to_string()))
            }
        }
    }

    /// Answer a server-initiated event that carried a `seq`.
    pub async fn respond(&self, seq: u64, payload: Value) -> Result<()> {
        self.tx
            .send(Frame::ack(seq, payload))
            .await
            .map_err(|_| Error::PeerUnreachable(format!("link to {} closed", self.addr)))
    }

    /// Tear the connection down. Safe to call through a shared handle.
    pub fn close(&self) {
        self.closed.notify_waiters();
        self.reader_task.abort();
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.close();
    }
}
