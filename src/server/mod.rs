//! Main chat server: shared state, the middleware pipeline, and the bus
//! event dispatch loop.

pub mod chat;
pub mod dns;
pub mod middleware;
pub mod migration;
pub mod p2p;
pub mod replication;
pub mod users;

pub use middleware::{Handled, Middleware, Pipeline};
pub use users::{User, UserTable};

use crate::bus::{BusEvent, BusServer};
use crate::error::{Error, Result};
use crate::ns;
use crate::types::{format_addr, MessageBody, Sid};
use crate::wire::Payload;
use chat::ChatMiddleware;
use dns::DnsMiddleware;
use migration::MigrationMiddleware;
use p2p::P2pMiddleware;
use replication::ReplicationMiddleware;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub ns_addr: SocketAddr,
    pub uri: String,
    pub ip: IpAddr,
    pub port: u16,
    pub min_user_count: usize,
    /// Started as a migration target: skip name-server registration, the
    /// retiring server will hand us its slot.
    pub migrating: bool,
}

/// State shared by every middleware through the server reference.
pub struct ServerState {
    pub cfg: ServerConfig,
    /// Our own `http://IP:PORT` identity as the registry sees it.
    pub addr: String,
    pub users: UserTable,
    pub messages: Mutex<BTreeMap<u64, MessageBody>>,
    pub min_user_count: AtomicUsize,
    pub history_sent: AtomicBool,
    pub migrating: AtomicBool,
    /// Console-driven outage simulation; drops all traffic while set.
    pub simulate_down: AtomicBool,
    /// Sessions belonging to name-server liveness probes.
    pub dns_sessions: Mutex<HashSet<Sid>>,
    /// Woken when the process should exit (migration done or TERMINAR).
    pub shutdown: Notify,
}

impl ServerState {
    fn new(cfg: ServerConfig) -> Arc<Self> {
        let addr = format_addr(cfg.ip, cfg.port);
        let min_user_count = cfg.min_user_count;
        Arc::new(Self {
            cfg,
            addr,
            users: UserTable::new(),
            messages: Mutex::new(BTreeMap::new()),
            min_user_count: AtomicUsize::new(min_user_count),
            history_sent: AtomicBool::new(false),
            migrating: AtomicBool::new(false),
            simulate_down: AtomicBool::new(false),
            dns_sessions: Mutex::new(HashSet::new()),
            shutdown: Notify::new(),
        })
    }
}

pub struct MainServer {
    pub state: Arc<ServerState>,
    pub bus: Arc<BusServer>,
    pipeline: Arc<Pipeline>,
    event_names: HashSet<String>,
    replication: Arc<ReplicationMiddleware>,
    migration: Arc<MigrationMiddleware>,
}

impl MainServer {
    /// Bind the bus, wire the pipeline, register with the name server, pair
    /// with the replica, and start the dispatch and migration tasks.
    pub async fn start(mut cfg: ServerConfig) -> Result<Arc<Self>> {
        let bind: SocketAddr = (cfg.ip, cfg.port).into();
        let (bus, events) = BusServer::bind(bind).await?;
        // Port 0 means "any"; our registry identity uses the bound port.
        cfg.port = bus.local_addr().port();
        let state = ServerState::new(cfg);

        let dns = Arc::new(DnsMiddleware::new(Arc::clone(&state)));
        let migration = Arc::new(MigrationMiddleware::new(
            Arc::clone(&state),
            Arc::clone(&bus),
        ));
        let replication = Arc::new(ReplicationMiddleware::new(Arc::clone(&state)));
        let p2p = Arc::new(P2pMiddleware::new(Arc::clone(&state)));
        let chat = Arc::new(ChatMiddleware::new(Arc::clone(&state), Arc::clone(&bus)));

        let pipeline = Arc::new(Pipeline::new(vec![
            dns as Arc<dyn Middleware>,
            Arc::clone(&migration) as Arc<dyn Middleware>,
            Arc::clone(&replication) as Arc<dyn Middleware>,
            p2p as Arc<dyn Middleware>,
            chat as Arc<dyn Middleware>,
        ]));
        let event_names = pipeline.event_union();

        let server = Arc::new(Self {
            state: Arc::clone(&state),
            bus: Arc::clone(&bus),
            pipeline,
            event_names,
            replication: Arc::clone(&replication),
            migration: Arc::clone(&migration),
        });

        Arc::clone(&bus).start().await;
        info!("chat server listening on {}", state.addr);

        server.register_in_ns().await?;
        replication.pair().await;
        tokio::spawn(Arc::clone(&migration).run_cycle());

        let dispatch = Arc::clone(&server);
        tokio::spawn(dispatch.dispatch_loop(events));

        Ok(server)
    }

    /// Announce ourselves to the name server. A refusal (or an unreachable
    /// name server) is fatal; a `--migrating` target skips this entirely.
    async fn register_in_ns(&self) -> Result<()> {
        if self.state.cfg.migrating {
            debug!("migration target: skipping registration");
            return Ok(());
        }
        let cfg = &self.state.cfg;
        let active = ns::client::register_server(cfg.ns_addr, &cfg.uri, &self.state.addr)
            .await
            .map_err(|e| Error::RegistrationRefused(e.to_string()))?;
        if !active {
            return Err(Error::RegistrationRefused(format!(
                "{} already has a full replica pair",
                cfg.uri
            )));
        }
        Ok(())
    }

    async fn dispatch_loop(self: Arc<Self>, mut events: mpsc::Receiver<BusEvent>) {
        while let Some(event) = events.recv().await {
            let server = Arc::clone(&self);
            // Handlers block on replica round trips; each event gets its
            // own task so sessions stay independent.
            tokio::spawn(async move { server.handle_bus_event(event).await });
        }
    }

    async fn handle_bus_event(&self, event: BusEvent) {
        match event {
            BusEvent::Connect { sid, auth, reply } => {
                if self.state.simulate_down.load(Ordering::SeqCst) {
                    let _ = reply.send(Err("server unavailable".into()));
                    return;
                }
                let mut data = auth;
                let verdict = match self.pipeline.dispatch("connect", &sid, &mut data).await {
                    Ok(merged) => Ok(merged),
                    Err(e) => {
                        debug!("connect from {} refused: {}", sid, e);
                        Err(e.to_string())
                    }
                };
                let _ = reply.send(verdict);
            }
            BusEvent::Message {
                sid,
                event,
                payload,
                responder,
            } => {
                if self.state.simulate_down.load(Ordering::SeqCst) {
                    debug!("simulated outage, dropping {}", event);
                    return;
                }
                if !self.event_names.contains(&event) {
                    debug!("unroutable event {}", event);
                    return;
                }
                let mut data = payload;
                match self.pipeline.dispatch(&event, &sid, &mut data).await {
                    Ok(merged) => {
                        if let Some(responder) = responder {
                            responder.send(merged).await;
                        }
                    }
                    Err(e) => warn!("{} from {} failed: {}", event, sid, e),
                }
            }
            BusEvent::Disconnect { sid } => {
                if self.state.simulate_down.load(Ordering::SeqCst) {
                    return;
                }
                let mut data = Payload::new();
                if let Err(e) = self.pipeline.dispatch("disconnect", &sid, &mut data).await {
                    warn!("disconnect of {} failed: {}", sid, e);
                }
            }
        }
    }

    /// One manual migration attempt (console/test hook; the background
    /// cycle calls the same path).
    pub async fn migrate_now(&self) -> Result<()> {
        self.migration.migrate().await
    }

    pub async fn has_replica(&self) -> bool {
        self.replication.has_replica().await
    }

    /// Say goodbye and close the transport. `announce` additionally tells
    /// clients the server is going away (console shutdown); migration skips
    /// it because `reconnect` was already broadcast.
    pub async fn shutdown(&self, announce: bool) {
        if announce {
            self.bus.broadcast("server_down", Value::Null).await;
        }
        let dns_sids: Vec<Sid> = self.state.dns_sessions.lock().await.iter().cloned().collect();
        for sid in dns_sids {
            let _ = self.bus.emit(&sid, "server_down_dns", Value::Null).await;
        }
        self.bus.shutdown().await;
    }
}
