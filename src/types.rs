//! Shared domain types and address helpers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Default TCP port the name server listens on.
pub const DEFAULT_NS_PORT: u16 = 8000;

/// Transport-layer session identifier. Fresh per connection, not stable
/// across reconnects.
pub type Sid = String;

/// One chat line as stored in the message log, keyed externally by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub username: String,
    pub message: String,
}

/// Format a server address the way the rest of the system passes it around.
/// Everything but the main server treats these as opaque strings.
pub fn format_addr(ip: IpAddr, port: u16) -> String {
    format!("http://{}:{}", ip, port)
}

/// Parse an `http://IP:PORT` address back into a socket address.
pub fn parse_addr(addr: &str) -> Result<SocketAddr> {
    let rest = addr
        .strip_prefix("http://")
        .ok_or_else(|| Error::Malformed(format!("address without scheme: {addr}")))?;
    rest.parse()
        .map_err(|_| Error::Malformed(format!("unparseable address: {addr}")))
}

/// Extract just the IPv4 part of an `http://IP:PORT` address.
pub fn addr_ipv4(addr: &str) -> Option<Ipv4Addr> {
    match parse_addr(addr).ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_round_trip() {
        let addr = format_addr("10.0.0.5".parse().unwrap(), 4000);
        assert_eq!(addr, "http://10.0.0.5:4000");
        let sock = parse_addr(&addr).unwrap();
        assert_eq!(sock.port(), 4000);
        assert_eq!(addr_ipv4(&addr), Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn rejects_schemeless_addr() {
        assert!(parse_addr("10.0.0.5:4000").is_err());
        assert!(parse_addr("http://nonsense").is_err());
    }
}
