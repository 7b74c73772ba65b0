//! Name server binary.

use clap::Parser;
use errant::ns::NameServer;
use errant::types::DEFAULT_NS_PORT;
use std::net::{IpAddr, SocketAddr};
use tracing::error;

#[derive(Parser)]
#[command(name = "errant-ns", version, about = "Chat service name server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_NS_PORT)]
    port: u16,
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
    let addr = SocketAddr::new(args.host, args.port);

    let ns = match NameServer::bind(addr).await {
        Ok(ns) => ns,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = ns.run().await {
        error!("name server stopped: {}", e);
        std::process::exit(1);
    }
}
