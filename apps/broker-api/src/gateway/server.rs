//! WebSocket upgrade handler and the per-connection duplex pump.
//!
//! Each accepted connection runs two loops: an inbound loop that forwards
//! every client frame to the bus, and an outbound loop that drains the
//! connection's queue and injects keepalive probes. Either loop ending for
//! any reason resolves to a Disconnect event; teardown is reactive.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time;

use crate::broker::events::BusPublish;
use crate::broker::registry::{ConnectionHandle, ConnectionId, OUTBOUND_QUEUE_CAPACITY};
use crate::broker::BrokerHandle;
use crate::config::Config;
use crate::AppState;

pub fn router(config: &Config) -> Router<AppState> {
    Router::new().route(&config.ws_path, get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let Some(session_id) = extract_session_id(&state.config, &headers, &params) else {
        tracing::debug!("handshake rejected: missing session id");
        return (StatusCode::BAD_REQUEST, "missing session id").into_response();
    };

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_connection(socket, state, session_id))
        .into_response()
}

/// Pull the session id out of the handshake, from a header or a query
/// parameter depending on configuration. The id is opaque to the core.
fn extract_session_id(
    config: &Config,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Option<String> {
    let raw = if config.session_id_from_header {
        headers
            .get(config.session_id_key.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    } else {
        params.get(&config.session_id_key).cloned()
    };
    raw.filter(|s| !s.is_empty())
}

async fn handle_connection(socket: WebSocket, state: AppState, session_id: String) {
    let (ws_tx, ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

    let conn = ConnectionHandle::new(session_id.clone(), outbound_tx);
    let conn_id = conn.id.clone();
    state.broker.connect(conn).await;

    tracing::info!(%session_id, %conn_id, "session connected");

    let mut writer = tokio::spawn(write_pump(
        ws_tx,
        outbound_rx,
        state.broker.clone(),
        conn_id.clone(),
        state.config.write_wait,
        state.config.ping_period,
    ));

    // Either half ending tears the whole socket down. In particular, when the
    // broker removes this connection (supersede, empty-update teardown) the
    // write pump exits on its closed queue and the read half must die with
    // it, or a stale peer could keep publishing under the session id.
    tokio::select! {
        _ = read_pump(ws_rx, &state, &session_id) => {
            state.broker.disconnect(conn_id.clone()).await;
            let _ = writer.await;
        }
        // The write pump already issued the Disconnect; dropping the read
        // future here releases the receive half and closes the socket.
        _ = &mut writer => {}
    }

    tracing::info!(%session_id, %conn_id, "session disconnected");
}

/// Inbound loop: reads frames until error, close, or read-deadline expiry,
/// forwarding every payload to the bus tagged with the session id. Any
/// inbound frame (pong included) refreshes the read deadline.
async fn read_pump(mut ws_rx: SplitStream<WebSocket>, state: &AppState, session_id: &str) {
    let channel = format!("{}{}", state.config.channels.data_from_client, session_id);

    loop {
        let msg = match time::timeout(state.config.pong_wait, ws_rx.next()).await {
            Err(_) => {
                tracing::debug!(%session_id, "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(?e, %session_id, "ws read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let payload = match msg {
            Message::Text(text) => Bytes::from(text.to_string().into_bytes()),
            Message::Binary(data) => data,
            // Client pings are answered by the transport layer.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        // Bounded hand-off: a backlogged bus stalls only this connection's
        // reads, never the broker or the other connections.
        let publish = BusPublish {
            channel: channel.clone(),
            payload,
        };
        if state.publish.send(publish).await.is_err() {
            tracing::warn!(%session_id, "bus publisher gone, dropping inbound message");
            break;
        }
    }
}

/// Outbound loop: drains the queue and injects keepalive probes, applying a
/// write deadline to every transport write. A closed queue means the broker
/// tore this connection down; answer with a best-effort close frame.
async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: tokio::sync::mpsc::Receiver<Bytes>,
    broker: BrokerHandle,
    conn_id: ConnectionId,
    write_wait: Duration,
    ping_period: Duration,
) {
    let mut keepalive = time::interval(ping_period);
    keepalive.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            payload = outbound.recv() => match payload {
                Some(payload) => {
                    if !write(&mut ws_tx, Message::Binary(payload), write_wait).await {
                        break;
                    }
                }
                None => {
                    let _ = write(&mut ws_tx, Message::Close(None), write_wait).await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                if !write(&mut ws_tx, Message::Ping(Bytes::new()), write_wait).await {
                    break;
                }
            }
        }
    }

    broker.disconnect(conn_id).await;
}

/// One transport write under a deadline. Deadline expiry is treated exactly
/// like a write error: the connection is dead.
async fn write(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    write_wait: Duration,
) -> bool {
    match time::timeout(write_wait, ws_tx.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(?e, "ws write error");
            false
        }
        Err(_) => {
            tracing::debug!("write deadline exceeded");
            false
        }
    }
}
