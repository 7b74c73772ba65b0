pub mod bus;
pub mod error;
pub mod ns;
pub mod server;
pub mod types;
pub mod wire;

pub use bus::{BusClient, BusEvent, BusServer, ClientEvent};
pub use error::{Error, Result};
pub use ns::{NameServer, Registry};
pub use server::{MainServer, ServerConfig, ServerState};
pub use types::{format_addr, parse_addr, MessageBody, Sid, DEFAULT_NS_PORT};
pub use wire::{Frame, Payload};
