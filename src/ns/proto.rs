//! Name-server wire protocol.
//!
//! One framed request per TCP connection, one reply, close. Requests and
//! replies are JSON maps tagged by a `name` field.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum NsRequest {
    /// A booting server announces itself for a uri.
    UpdateServer { uri: String, addr: String },
    /// A client asks for the closest active server (caller IP comes from
    /// the socket).
    AddrRequest { uri: String },
    /// Any known-but-inactive address, as a migration candidate.
    GetRandomServer { uri: String },
    /// Migration pointer swap: `self_addr` hands its slot to `addr`.
    SetCurrentServer {
        uri: String,
        addr: String,
        self_addr: String,
    },
    /// The other active address for the uri.
    GetReplicaAddr { uri: String, my_addr: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum NsResponse {
    UpdateServerResponse {
        addr: String,
        active_server: bool,
    },
    AddrResponse {
        req_uri: String,
        addr: Option<String>,
        status: u16,
    },
    RandomServerResponse {
        addr: Option<String>,
    },
    SetCurrentServerResponse {},
    GetReplicaAddrResponse {
        /// Empty string when the uri has no other active server.
        addr: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(req: NsRequest) {
        let json = serde_json::to_string(&req).unwrap();
        let back: NsRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn requests_round_trip() {
        round_trip(NsRequest::UpdateServer {
            uri: "backend.com".into(),
            addr: "http://10.0.0.1:4000".into(),
        });
        round_trip(NsRequest::AddrRequest {
            uri: "backend.com".into(),
        });
        round_trip(NsRequest::GetRandomServer {
            uri: "backend.com".into(),
        });
        round_trip(NsRequest::SetCurrentServer {
            uri: "backend.com".into(),
            addr: "http://10.0.0.2:4000".into(),
            self_addr: "http://10.0.0.1:4000".into(),
        });
        round_trip(NsRequest::GetReplicaAddr {
            uri: "backend.com".into(),
            my_addr: "http://10.0.0.1:4000".into(),
        });
    }

    #[test]
    fn tag_matches_request_kind() {
        let json = serde_json::to_value(NsRequest::AddrRequest {
            uri: "backend.com".into(),
        })
        .unwrap();
        assert_eq!(json["name"], "addr_request");
    }

    #[test]
    fn miss_reply_is_404() {
        let reply = NsResponse::AddrResponse {
            req_uri: "nowhere".into(),
            addr: None,
            status: 404,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], 404);
        assert!(json["addr"].is_null());
    }
}
