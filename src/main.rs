//! Chat server binary.
//!
//! Registers with the name server, serves clients over the event bus, and
//! runs the periodic migration cycle. The interactive console drives the
//! outage simulation and shutdown.

use clap::Parser;
use errant::server::{MainServer, ServerConfig};
use errant::types::DEFAULT_NS_PORT;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "errant-server", version, about = "Migratory chat server")]
struct Args {
    /// Name server ip
    #[arg(long, default_value = "127.0.0.1")]
    dns_ip: IpAddr,

    /// Name server port
    #[arg(long, default_value_t = DEFAULT_NS_PORT)]
    dns_port: u16,

    /// Service URI to host
    #[arg(short = 'u', long, default_value = "backend.com")]
    server_uri: String,

    /// Minimum number of clients before chat starts flowing
    #[arg(short = 'n', long, default_value_t = 0)]
    min_n: usize,

    /// Optional. Server ip
    #[arg(long)]
    server_ip: Option<IpAddr>,

    /// Optional. Server port
    #[arg(long, default_value_t = 0)]
    server_port: u16,

    /// Started by a client as a migration target; skips registration
    #[arg(long, default_value_t = false)]
    migrating: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("errant=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let ip = args
        .server_ip
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));

    let cfg = ServerConfig {
        ns_addr: SocketAddr::new(args.dns_ip, args.dns_port),
        uri: args.server_uri,
        ip,
        port: args.server_port,
        min_user_count: args.min_n,
        migrating: args.migrating,
    };

    info!("errant-server v{} hosting {}", VERSION, cfg.uri);

    let server = match MainServer::start(cfg).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {}", e);
            std::process::exit(1);
        }
    };

    tokio::spawn(console_loop(Arc::clone(&server)));

    server.state.shutdown.notified().await;
    let migrated = server.state.migrating.load(Ordering::SeqCst);
    server.shutdown(!migrated).await;
    info!("bye");
}

/// Console commands: APAGAR (simulate down), PRENDER (back up),
/// TERMINAR (shut down).
async fn console_loop(server: Arc<MainServer>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("Ingrese APAGAR o PRENDER para cambiar el estado del servidor:");
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => return,
        };
        match line.trim() {
            "APAGAR" => {
                info!("simulating outage");
                server.state.simulate_down.store(true, Ordering::SeqCst);
            }
            "PRENDER" => {
                info!("back up");
                server.state.simulate_down.store(false, Ordering::SeqCst);
            }
            "TERMINAR" => {
                info!("shutting down");
                server.state.shutdown.notify_one();
                return;
            }
            other => println!("Comando no reconocido: {other}"),
        }
    }
}
