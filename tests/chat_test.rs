//! Single-server chat flow over real sockets: indices, history, admission.

use errant::bus::{BusClient, ClientEvent, ACK_TIMEOUT};
use errant::ns::NameServer;
use errant::server::{MainServer, ServerConfig};
use errant::wire::Payload;
use errant::Error;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const URI: &str = "backend.com";

async fn spawn_ns() -> SocketAddr {
    let ns = NameServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = ns.local_addr().unwrap();
    tokio::spawn(ns.run());
    addr
}

async fn start_server(ns_addr: SocketAddr, min_n: usize) -> Arc<MainServer> {
    MainServer::start(ServerConfig {
        ns_addr,
        uri: URI.to_string(),
        ip: "127.0.0.1".parse().unwrap(),
        port: 0,
        min_user_count: min_n,
        migrating: false,
    })
    .await
    .unwrap()
}

fn auth_for(name: &str, reconnecting: bool) -> Payload {
    let mut auth = Payload::new();
    auth.insert("username".into(), json!(name));
    auth.insert("publicUri".into(), json!(format!("p2p://{name}")));
    auth.insert("reconnecting".into(), json!(reconnecting));
    auth
}

async fn connect(
    addr: &str,
    name: &str,
) -> errant::Result<(BusClient, mpsc::Receiver<ClientEvent>)> {
    BusClient::connect(addr, auth_for(name, false)).await
}

/// Skip events until one with the wanted name shows up.
async fn wait_for(rx: &mut mpsc::Receiver<ClientEvent>, name: &str) -> ClientEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if event.name == name {
            return event;
        }
    }
}

#[tokio::test]
async fn solo_chat_assigns_dense_indices() {
    let ns_addr = spawn_ns().await;
    let server = start_server(ns_addr, 0).await;
    let addr = server.state.addr.clone();

    let (a, mut a_rx) = connect(&addr, "A").await.unwrap();
    let (b, mut b_rx) = connect(&addr, "B").await.unwrap();

    a.emit_with_ack("chat", json!({"message": "hi"}), ACK_TIMEOUT)
        .await
        .unwrap();
    b.emit_with_ack("chat", json!({"message": "there"}), ACK_TIMEOUT)
        .await
        .unwrap();

    for rx in [&mut a_rx, &mut b_rx] {
        let first = wait_for(rx, "chat").await;
        assert_eq!(first.payload["index"], 0);
        assert_eq!(first.payload["username"], "A");
        assert_eq!(first.payload["message"], "hi");

        let second = wait_for(rx, "chat").await;
        assert_eq!(second.payload["index"], 1);
        assert_eq!(second.payload["username"], "B");
        assert_eq!(second.payload["message"], "there");
    }

    let log = server.state.messages.lock().await.clone();
    assert_eq!(log.len(), 2);
    assert_eq!(log[&0].username, "A");
    assert_eq!(log[&0].message, "hi");
    assert_eq!(log[&1].username, "B");
    assert_eq!(log[&1].message, "there");
}

#[tokio::test]
async fn reconnect_reclaims_the_same_uuid() {
    let ns_addr = spawn_ns().await;
    let server = start_server(ns_addr, 0).await;
    let addr = server.state.addr.clone();

    let (alice, mut rx) = connect(&addr, "alice").await.unwrap();
    let uuid_event = wait_for(&mut rx, "send_uuid").await;
    let first_uuid = uuid_event.payload.as_str().unwrap().to_string();

    alice.close();
    // The tombstone lands once the server notices the hangup.
    for _ in 0..100 {
        if let Some(user) = server.state.users.by_name("alice").await {
            if user.disconnected {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (_alice2, mut rx2) = BusClient::connect(&addr, auth_for("alice", true))
        .await
        .unwrap();
    let uuid_event = wait_for(&mut rx2, "send_uuid").await;
    assert_eq!(uuid_event.payload.as_str().unwrap(), first_uuid);

    let live = server.state.users.by_name("alice").await.unwrap();
    assert!(!live.disconnected);
    assert_eq!(live.uuid, first_uuid);
}

#[tokio::test]
async fn duplicate_live_name_is_refused() {
    let ns_addr = spawn_ns().await;
    let server = start_server(ns_addr, 0).await;
    let addr = server.state.addr.clone();

    let (_carol, _rx) = connect(&addr, "carol").await.unwrap();
    let second = connect(&addr, "carol").await;
    assert!(matches!(second, Err(Error::ConnectionRefused(_))));
}

#[tokio::test]
async fn addr_request_returns_peer_endpoint() {
    let ns_addr = spawn_ns().await;
    let server = start_server(ns_addr, 0).await;
    let addr = server.state.addr.clone();

    let (a, _a_rx) = connect(&addr, "A").await.unwrap();
    let (_b, _b_rx) = connect(&addr, "B").await.unwrap();

    let reply = a
        .emit_with_ack("addr_request", json!({"username": "B"}), ACK_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reply["uri"], "p2p://B");
    assert!(reply["uuid"].is_string());

    let miss = a
        .emit_with_ack("addr_request", json!({"username": "nobody"}), ACK_TIMEOUT)
        .await
        .unwrap();
    assert!(miss["uri"].is_null());
    assert!(miss["uuid"].is_null());
}

#[tokio::test]
async fn history_waits_for_the_user_threshold() {
    let ns_addr = spawn_ns().await;
    let server = start_server(ns_addr, 2).await;
    let addr = server.state.addr.clone();

    let (a, mut a_rx) = connect(&addr, "A").await.unwrap();
    // Below the threshold the chat is logged but not fanned out.
    a.emit_with_ack("chat", json!({"message": "early"}), ACK_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(server.state.messages.lock().await.len(), 1);

    // The second user tips the count; the backlog goes to everyone.
    let (_b, mut b_rx) = connect(&addr, "B").await.unwrap();
    let history = wait_for(&mut b_rx, "message_history").await;
    let messages = history.payload["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0][0], 0);
    assert_eq!(messages[0][1]["username"], "A");

    let history_a = wait_for(&mut a_rx, "message_history").await;
    assert_eq!(history_a.payload["messages"].as_array().unwrap().len(), 1);
}
