use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite;

use broker_api::broker::events::BusPublish;
use broker_api::config::{BusChannels, Config};
use broker_api::AppState;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config() -> Config {
    let pong_wait = Duration::from_secs(60);
    Config {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ws_path: "/ws".to_string(),
        session_id_from_header: false,
        session_id_key: "session".to_string(),
        redis_url: "redis://127.0.0.1:6379".to_string(),
        write_wait: Duration::from_secs(10),
        pong_wait,
        ping_period: broker_api::config::ping_period(pong_wait),
        max_message_size: 65536,
        end_session_on_empty_update: true,
        channels: BusChannels::with_prefix("test:"),
    }
}

/// Helper: start an actual TCP server for WebSocket testing. The receiver is
/// the bus publish queue, so tests observe everything the core would publish.
async fn start_server(config: Config) -> (SocketAddr, AppState, mpsc::Receiver<BusPublish>) {
    let config = Arc::new(config);
    let (publish_tx, publish_rx) = mpsc::channel(64);
    let broker = broker_api::broker::spawn(config.clone(), publish_tx.clone());
    let state = AppState {
        config: config.clone(),
        broker,
        publish: publish_tx,
    };

    let app = broker_api::routes::router(&config).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state, publish_rx)
}

/// Helper: open a WebSocket with the session id in the query string.
async fn connect(addr: SocketAddr, session_id: &str) -> WsStream {
    let url = format!("ws://{addr}/ws?session={session_id}");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

/// Helper: poll the registry until it holds `expected` sessions.
async fn wait_for_sessions(state: &AppState, expected: usize) {
    for _ in 0..100 {
        let snap = state.broker.snapshot().await.expect("broker alive");
        if snap.sessions.len() == expected {
            return;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {expected} sessions");
}

/// Helper: receive the next bus publish within a deadline.
async fn next_publish(publish_rx: &mut mpsc::Receiver<BusPublish>) -> BusPublish {
    time::timeout(Duration::from_secs(5), publish_rx.recv())
        .await
        .expect("timeout waiting for bus publish")
        .expect("publish queue closed")
}

/// Helper: receive the next data frame (text or binary) as bytes.
async fn next_payload(ws: &mut WsStream) -> Vec<u8> {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for ws message")
            .expect("stream ended")
            .expect("ws read error");
        match msg {
            tungstenite::Message::Text(text) => return text.as_bytes().to_vec(),
            tungstenite::Message::Binary(data) => return data.to_vec(),
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_registers_session_and_announces_it() {
    let (addr, state, mut publish_rx) = start_server(test_config()).await;

    let _ws = connect(addr, "abc").await;

    let announce = next_publish(&mut publish_rx).await;
    assert_eq!(announce.channel, "test:client-new");
    assert_eq!(announce.payload.as_ref(), b"abc");

    wait_for_sessions(&state, 1).await;
    let snap = state.broker.snapshot().await.unwrap();
    assert_eq!(snap.sessions, vec!["abc"]);
}

#[tokio::test]
async fn handshake_without_session_id_is_rejected() {
    let (addr, _state, _publish_rx) = start_server(test_config()).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err(), "upgrade should be refused");
}

#[tokio::test]
async fn inbound_frames_are_forwarded_to_the_bus() {
    let (addr, _state, mut publish_rx) = start_server(test_config()).await;

    let mut ws = connect(addr, "abc").await;
    ws.send(tungstenite::Message::Text("hello".into()))
        .await
        .expect("send");

    // First publish is the new-session announcement, then the client data.
    let announce = next_publish(&mut publish_rx).await;
    assert_eq!(announce.channel, "test:client-new");

    let data = next_publish(&mut publish_rx).await;
    assert_eq!(data.channel, "test:client-data:abc");
    assert_eq!(data.payload.as_ref(), b"hello");
}

#[tokio::test]
async fn broadcasts_fan_out_by_group_membership() {
    let (addr, state, _publish_rx) = start_server(test_config()).await;

    let mut abc = connect(addr, "abc").await;
    let mut xyz = connect(addr, "xyz").await;
    wait_for_sessions(&state, 2).await;

    // Membership arrives from the control plane; broadcasts from the bus.
    state
        .broker
        .membership_update("abc".into(), vec!["room1".into(), "room2".into()])
        .await;
    state
        .broker
        .membership_update("xyz".into(), vec!["room1".into()])
        .await;

    state
        .broker
        .group_broadcast("room1".into(), "to-room1".into())
        .await;
    assert_eq!(next_payload(&mut abc).await, b"to-room1");
    assert_eq!(next_payload(&mut xyz).await, b"to-room1");

    state
        .broker
        .group_broadcast("room2".into(), "to-room2".into())
        .await;
    assert_eq!(next_payload(&mut abc).await, b"to-room2");

    // xyz is not in room2 and must see nothing further.
    let quiet = time::timeout(Duration::from_millis(200), xyz.next()).await;
    assert!(quiet.is_err(), "xyz should not receive room2 traffic");
}

#[tokio::test]
async fn disconnect_removes_session_and_empty_groups() {
    let (addr, state, _publish_rx) = start_server(test_config()).await;

    let mut ws = connect(addr, "abc").await;
    wait_for_sessions(&state, 1).await;
    state
        .broker
        .membership_update("abc".into(), vec!["room1".into()])
        .await;

    ws.close(None).await.expect("close");
    wait_for_sessions(&state, 0).await;

    let snap = state.broker.snapshot().await.unwrap();
    assert!(snap.groups.is_empty(), "room1 must be garbage-collected");

    // A late broadcast to the dead group is a silent no-op.
    state
        .broker
        .group_broadcast("room1".into(), "late".into())
        .await;
    let snap = state.broker.snapshot().await.unwrap();
    assert!(snap.sessions.is_empty());
    assert!(snap.groups.is_empty());
}

#[tokio::test]
async fn reconnect_supersedes_previous_connection() {
    let (addr, state, _publish_rx) = start_server(test_config()).await;

    let mut first = connect(addr, "abc").await;
    wait_for_sessions(&state, 1).await;
    state
        .broker
        .membership_update("abc".into(), vec!["room1".into()])
        .await;

    let mut second = connect(addr, "abc").await;

    // The superseded connection gets a close frame (or the stream just ends).
    let msg = time::timeout(Duration::from_secs(5), first.next())
        .await
        .expect("timeout waiting for close");
    match msg {
        Some(Ok(tungstenite::Message::Close(_))) | None => {}
        other => panic!("expected close on superseded connection, got {other:?}"),
    }

    wait_for_sessions(&state, 1).await;
    let snap = state.broker.snapshot().await.unwrap();
    assert_eq!(snap.sessions, vec!["abc"]);
    // The old connection's membership went with it.
    assert!(snap.groups.is_empty());

    // Delivery now targets the new connection only.
    state
        .broker
        .membership_update("abc".into(), vec!["room1".into()])
        .await;
    state
        .broker
        .group_broadcast("room1".into(), "fresh".into())
        .await;
    assert_eq!(next_payload(&mut second).await, b"fresh");
}

#[tokio::test]
async fn superseded_connection_cannot_publish_client_data() {
    let (addr, state, mut publish_rx) = start_server(test_config()).await;

    let mut first = connect(addr, "abc").await;
    wait_for_sessions(&state, 1).await;
    assert_eq!(next_publish(&mut publish_rx).await.channel, "test:client-new");

    let mut second = connect(addr, "abc").await;
    assert_eq!(next_publish(&mut publish_rx).await.channel, "test:client-new");

    // The server closes the superseded transport outright.
    let msg = time::timeout(Duration::from_secs(5), first.next())
        .await
        .expect("timeout waiting for close");
    match msg {
        Some(Ok(tungstenite::Message::Close(_))) | None => {}
        other => panic!("expected close on superseded connection, got {other:?}"),
    }

    // A frame pushed down the dead transport must never reach the bus; the
    // send itself may fail, which is fine.
    let _ = first
        .send(tungstenite::Message::Text("stale-after-supersede".into()))
        .await;

    // The replacement still publishes under the session.
    second
        .send(tungstenite::Message::Text("fresh".into()))
        .await
        .expect("send on live connection");
    let data = next_publish(&mut publish_rx).await;
    assert_eq!(data.channel, "test:client-data:abc");
    assert_eq!(data.payload.as_ref(), b"fresh");

    // And nothing stale follows it.
    let quiet = time::timeout(Duration::from_millis(200), publish_rx.recv()).await;
    assert!(quiet.is_err(), "superseded connection must not publish");
}

#[tokio::test]
async fn empty_membership_update_ends_the_session() {
    let (addr, state, _publish_rx) = start_server(test_config()).await;

    let mut ws = connect(addr, "abc").await;
    wait_for_sessions(&state, 1).await;
    state
        .broker
        .membership_update("abc".into(), vec!["room1".into()])
        .await;

    state.broker.membership_update("abc".into(), vec![]).await;
    wait_for_sessions(&state, 0).await;

    let msg = time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout waiting for close");
    match msg {
        Some(Ok(tungstenite::Message::Close(_))) | None => {}
        other => panic!("expected close after empty update, got {other:?}"),
    }
}

#[tokio::test]
async fn silent_peer_is_disconnected_after_pong_wait() {
    let mut config = test_config();
    config.pong_wait = Duration::from_millis(300);
    config.ping_period = broker_api::config::ping_period(config.pong_wait);
    let (addr, state, mut publish_rx) = start_server(config).await;

    // Never poll the socket: the client answers no pings, sends nothing.
    let _ws = connect(addr, "abc").await;

    // Once the announcement goes out the session is registered.
    let announce = next_publish(&mut publish_rx).await;
    assert_eq!(announce.channel, "test:client-new");

    wait_for_sessions(&state, 0).await;
}

#[tokio::test]
async fn oversized_message_terminates_the_connection() {
    let mut config = test_config();
    config.max_message_size = 64;
    let (addr, state, _publish_rx) = start_server(config).await;

    let mut ws = connect(addr, "abc").await;
    wait_for_sessions(&state, 1).await;

    let big = "x".repeat(1024);
    // The server may drop the connection mid-send; either way it must unregister.
    let _ = ws.send(tungstenite::Message::Text(big.into())).await;
    wait_for_sessions(&state, 0).await;
}

#[tokio::test]
async fn introspection_endpoints_reflect_the_registry() {
    let (addr, state, _publish_rx) = start_server(test_config()).await;

    let _ws = connect(addr, "abc").await;
    wait_for_sessions(&state, 1).await;
    state
        .broker
        .membership_update("abc".into(), vec!["room1".into(), "room2".into()])
        .await;

    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("health request")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["status"], "ok");
    assert_eq!(health["service"], "broker-api");

    let status = client
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .expect("status request")
        .text()
        .await
        .expect("status body");
    assert_eq!(status, "1");

    let clients: serde_json::Value = client
        .get(format!("http://{addr}/clients"))
        .send()
        .await
        .expect("clients request")
        .json()
        .await
        .expect("clients json");
    assert_eq!(clients["abc"], serde_json::json!(["room1", "room2"]));

    let groups: serde_json::Value = client
        .get(format!("http://{addr}/groups"))
        .send()
        .await
        .expect("groups request")
        .json()
        .await
        .expect("groups json");
    assert_eq!(groups["room1"], serde_json::json!(["abc"]));
    assert_eq!(groups["room2"], serde_json::json!(["abc"]));

    let sessions: serde_json::Value = client
        .get(format!("http://{addr}/sessions"))
        .send()
        .await
        .expect("sessions request")
        .json()
        .await
        .expect("sessions json");
    assert_eq!(sessions, serde_json::json!(["abc"]));
}
