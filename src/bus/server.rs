//! Accepting side of the event bus.

use super::{EVENT_QUEUE, FRAME_QUEUE};
use crate::error::{Error, Result};
use crate::types::Sid;
use crate::wire::{self, Frame, Payload};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Inbound traffic as seen by the application.
pub enum BusEvent {
    /// A new connection presented its auth payload. The application answers
    /// through `reply`: `Ok(reply_payload)` accepts the session, `Err(reason)`
    /// refuses and closes it.
    Connect {
        sid: Sid,
        auth: Payload,
        reply: oneshot::Sender<std::result::Result<Payload, String>>,
    },
    /// A named event from an established session. `responder` is present when
    /// the sender asked for an acknowledgement.
    Message {
        sid: Sid,
        event: String,
        payload: Payload,
        responder: Option<Responder>,
    },
    /// The session's socket went away.
    Disconnect { sid: Sid },
}

/// Handle for acknowledging one event.
pub struct Responder {
    tx: mpsc::Sender<Frame>,
    seq: u64,
}

impl Responder {
    /// Send the reply payload back as the event's ack.
    pub async fn send(self, payload: Payload) {
        let frame = Frame::ack(self.seq, Value::Object(payload));
        if self.tx.send(frame).await.is_err() {
            debug!("ack {} dropped, session already gone", self.seq);
        }
    }
}

struct Session {
    tx: mpsc::Sender<Frame>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
}

/// Event-bus listener. One per server process.
pub struct BusServer {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    sessions: Mutex<HashMap<Sid, Session>>,
    events: mpsc::Sender<BusEvent>,
    next_seq: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    conn_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BusServer {
    /// Bind the listener. Call [`BusServer::start`] to begin accepting.
    pub async fn bind(addr: SocketAddr) -> Result<(Arc<Self>, mpsc::Receiver<BusEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let server = Arc::new(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            sessions: Mutex::new(HashMap::new()),
            events: tx,
            next_seq: AtomicU64::new(1),
            accept_task: Mutex::new(None),
            conn_tasks: Mutex::new(Vec::new()),
        });
        Ok((server, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop.
    pub async fn start(self: Arc<Self>) {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .expect("bus started twice");
        let server = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("bus connection from {}", peer);
                        let session_server = Arc::clone(&server);
                        let handle = tokio::spawn(async move {
                            if let Err(e) = session_server.run_session(stream).await {
                                debug!("session from {} ended: {}", peer, e);
                            }
                        });
                        let mut tasks = server.conn_tasks.lock().await;
                        tasks.retain(|t| !t.is_finished());
                        tasks.push(handle);
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        *self.accept_task.lock().await = Some(handle);
    }

    /// Targeted emit without an acknowledgement.
    pub async fn emit(&self, sid: &str, event: &str, payload: Value) -> Result<()> {
        let tx = self.session_tx(sid).await?;
        tx.send(Frame::event(event, payload))
            .await
            .map_err(|_| Error::PeerUnreachable(format!("session {sid} closed")))
    }

    /// Targeted emit, waiting up to `timeout` for the session's ack.
    pub async fn emit_with_ack(
        &self,
        sid: &str,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Payload> {
        let (tx, pending) = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(sid)
                .ok_or_else(|| Error::LookupMiss(format!("no session {sid}")))?;
            (session.tx.clone(), Arc::clone(&session.pending))
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (ack_tx, ack_rx) = oneshot::channel();
        pending.lock().await.insert(seq, ack_tx);

        if tx
            .send(Frame::event_with_seq(event, seq, payload))
            .await
            .is_err()
        {
            pending.lock().await.remove(&seq);
            return Err(Error::PeerUnreachable(format!("session {sid} closed")));
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(value)) => wire::payload_map(value),
            Ok(Err(_)) => Err(Error::PeerUnreachable(format!("session {sid} closed"))),
            Err(_) => {
                pending.lock().await.remove(&seq);
                Err(Error::AckTimeout(event.to_string()))
            }
        }
    }

    /// Emit to every connected session.
    pub async fn broadcast(&self, event: &str, payload: Value) {
        let txs: Vec<(Sid, mpsc::Sender<Frame>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(sid, s)| (sid.clone(), s.tx.clone()))
                .collect()
        };
        for (sid, tx) in txs {
            if tx.send(Frame::event(event, payload.clone())).await.is_err() {
                debug!("broadcast {} skipped closed session {}", event, sid);
            }
        }
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Stop accepting and close every session.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }
        for handle in self.conn_tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.sessions.lock().await.clear();
    }

    async fn session_tx(&self, sid: &str) -> Result<mpsc::Sender<Frame>> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(sid)
            .map(|s| s.tx.clone())
            .ok_or_else(|| Error::LookupMiss(format!("no session {sid}")))
    }

    async fn run_session(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (mut read_half, write_half) = stream.into_split();

        // The first frame must be the auth handshake.
        let auth_frame: Frame = match wire::read_frame(&mut read_half).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        if auth_frame.event.as_deref() != Some("auth") {
            return Err(Error::Malformed("first frame was not auth".into()));
        }
        let auth_seq = auth_frame.seq.unwrap_or(0);
        let auth = wire::payload_map(auth_frame.payload)?;

        // The session joins the table before the connect verdict so that
        // handlers can already address it (uuid delivery, history, joins).
        // Anything they emit is queued behind the eventual auth ack... or in
        // front of it; the dialing side tolerates both orders.
        let sid: Sid = Uuid::new_v4().to_string();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let pending = Arc::new(Mutex::new(HashMap::new()));
        self.sessions.lock().await.insert(
            sid.clone(),
            Session {
                tx: frame_tx.clone(),
                pending: Arc::clone(&pending),
            },
        );
        tokio::spawn(writer_task(write_half, frame_rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .events
            .send(BusEvent::Connect {
                sid: sid.clone(),
                auth,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            self.sessions.lock().await.remove(&sid);
            return Ok(());
        }

        let verdict = reply_rx
            .await
            .unwrap_or_else(|_| Err("server shutting down".to_string()));

        // `connected` is the transport's own verdict field; middleware
        // replies (which may carry their own `status`) merge alongside it.
        let accepted = verdict.is_ok();
        let mut body = Payload::new();
        match verdict {
            Ok(reply) => {
                body.insert("connected".into(), Value::Bool(true));
                wire::merge_payload(&mut body, reply);
            }
            Err(reason) => {
                body.insert("connected".into(), Value::Bool(false));
                body.insert("reason".into(), Value::String(reason));
            }
        }
        let _ = frame_tx
            .send(Frame::ack(auth_seq, Value::Object(body)))
            .await;

        if !accepted {
            self.sessions.lock().await.remove(&sid);
            return Ok(());
        }

        self.reader_loop(&sid, &mut read_half, frame_tx, pending)
            .await;

        self.sessions.lock().await.remove(&sid);
        let _ = self.events.send(BusEvent::Disconnect { sid }).await;
        Ok(())
    }

    async fn reader_loop(
        &self,
        sid: &str,
        read_half: &mut OwnedReadHalf,
        frame_tx: mpsc::Sender<Frame>,
        pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    ) {
        loop {
            let frame: Frame = match wire::read_frame(read_half).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                // Undecodable body: the frame boundary is intact, so the
                // payload is dropped and the session survives.
                Err(Error::Codec(e)) => {
                    debug!("malformed frame from {}: {}", sid, e);
                    continue;
                }
                // Oversized length prefix desynchronizes the stream; that
                // connection is done.
                Err(e) => {
                    debug!("read error from {}: {}", sid, e);
                    break;
                }
            };

            if let Some(ack_seq) = frame.ack {
                if let Some(waiter) = pending.lock().await.remove(&ack_seq) {
                    let _ = waiter.send(frame.payload);
                } else {
                    debug!("unmatched ack {} from {}", ack_seq, sid);
                }
                continue;
            }

            let Some(event) = frame.event else {
                debug!("frame without event or ack from {}", sid);
                continue;
            };
            let payload = match wire::payload_map(frame.payload) {
                Ok(map) => map,
                Err(e) => {
                    debug!("dropping {} from {}: {}", event, sid, e);
                    continue;
                }
            };
            let responder = frame.seq.map(|seq| Responder {
                tx: frame_tx.clone(),
                seq,
            });
            if self
                .events
                .send(BusEvent::Message {
                    sid: sid.to_string(),
                    event,
                    payload,
                    responder,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

async fn writer_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = wire::write_frame(&mut write_half, &frame).await {
            debug!("write failed: {}", e);
            break;
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut write_half).await;
}
