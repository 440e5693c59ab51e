//! HTTP / WebSocket surface of the relay.
//!
//! `GET /ws` upgrades to the signaling socket (sub-protocol `ws`),
//! `GET /api/status` reports registry counts.

use super::{Admission, Relay, RelayStatus};
use crate::core::error::ConnectivityError;
use crate::core::protocol::ServerMessage;
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Policy violation: origin or address outside the allowed scope.
const CLOSE_NOT_ALLOWED: u16 = 1008;
/// Try again later: relay is full.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/status", get(status_handler))
        .with_state(relay)
}

/// Bind the configured address and serve until `sos` fires.
pub async fn serve(relay: Arc<Relay>, sos: SignalOfStop) -> Result<()> {
    let addr = format!("{}:{}", relay.config().host, relay.config().port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind relay on {addr}"))?;
    serve_on(listener, relay, sos).await
}

pub async fn serve_on(listener: TcpListener, relay: Arc<Relay>, sos: SignalOfStop) -> Result<()> {
    let local = listener.local_addr()?;
    info!(
        event = "relay_listening",
        addr = %local,
        mode = ?relay.config().mode,
        max_connections = relay.config().max_connections,
        "Relay listening"
    );
    axum::serve(
        listener,
        router(relay).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        sos.wait().await;
    })
    .await
    .context("relay server error")?;
    info!(event = "relay_stopped", "Relay stopped");
    Ok(())
}

async fn status_handler(State(relay): State<Arc<Relay>>) -> Json<RelayStatus> {
    Json(relay.status())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    // Registration waits for a completed upgrade: an aborted handshake must
    // not leave a device holding a connection slot.
    let screened = relay.screen(peer, &headers);
    ws.protocols(["ws"]).on_upgrade(move |socket| async move {
        match screened.and_then(|identity| relay.register(peer, identity)) {
            Ok(admission) => handle_socket(socket, relay, admission).await,
            Err(e) => reject(socket, peer, e).await,
        }
    })
}

async fn reject(mut socket: WebSocket, peer: SocketAddr, err: ConnectivityError) {
    let (code, reason) = match &err {
        ConnectivityError::AtCapacity(_) => (CLOSE_TRY_AGAIN_LATER, "Relay at capacity"),
        _ => (CLOSE_NOT_ALLOWED, "Connection not allowed"),
    };
    warn!(
        event = "relay_rejected",
        peer = %peer,
        code,
        error = %err,
        "Rejecting relay connection"
    );
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// One connection: inbound frames, outbound queue and liveness pings are
/// multiplexed on a single task.
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>, admission: Admission) {
    let Admission {
        device_id,
        mut outbox,
        ..
    } = admission;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let period = relay.config().ping_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let Some(frame) = frame else { break };
                last_seen = Instant::now();
                match frame {
                    Ok(Message::Text(text)) => relay.handle_text(&device_id, &text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(event = "relay_socket_error", device = %device_id, error = %e);
                        break;
                    }
                }
            }
            Some(msg) = outbox.recv() => {
                if let Err(e) = send_json(&mut ws_tx, &msg).await {
                    debug!(event = "relay_send_failed", device = %device_id, error = %e);
                    break;
                }
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() >= period * 2 {
                    warn!(event = "relay_stale_connection", device = %device_id, "No traffic for two ping intervals, terminating");
                    break;
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    error!(event = "relay_ping_failed", device = %device_id, error = %e, "Ping failed, terminating");
                    break;
                }
            }
        }
    }

    relay.disconnect(&device_id);
    let _ = ws_tx.close().await;
}

async fn send_json<S>(sink: &mut S, msg: &ServerMessage) -> Result<()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(msg)?;
    sink.send(Message::Text(text)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RelayConfig;
    use crate::core::protocol::ClientMessage;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn start(config: RelayConfig) -> (SocketAddr, SignalOfStop) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sos = SignalOfStop::new();
        let relay = Arc::new(Relay::new(config));
        tokio::spawn(serve_on(listener, relay, sos.clone()));
        (addr, sos)
    }

    async fn next_server_message<S>(stream: &mut S) -> ServerMessage
    where
        S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for relay")
                .expect("stream ended")
                .expect("socket error");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn devices_discover_each_other_over_websocket() {
        let (addr, sos) = start(RelayConfig::default()).await;
        let url = format!("ws://{addr}/ws");

        let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let nick = serde_json::to_string(&ClientMessage::SetNickname {
            nickname: "Alpha".into(),
        })
        .unwrap();
        a.send(WsMessage::Text(nick)).await.unwrap();

        match next_server_message(&mut b).await {
            ServerMessage::DeviceDiscovered { device } => assert_eq!(device.name, "Alpha"),
            other => panic!("unexpected {other:?}"),
        }

        let ping = serde_json::to_string(&ClientMessage::Ping).unwrap();
        b.send(WsMessage::Text(ping)).await.unwrap();
        assert_eq!(next_server_message(&mut b).await, ServerMessage::Pong);

        a.close(None).await.unwrap();
        assert!(matches!(
            next_server_message(&mut b).await,
            ServerMessage::DeviceDisconnected { .. }
        ));
        sos.cancel();
    }

    #[tokio::test]
    async fn full_relay_closes_with_try_again_later() {
        let (addr, sos) = start(RelayConfig {
            max_connections: 1,
            ..RelayConfig::default()
        })
        .await;
        let url = format!("ws://{addr}/ws");
        let (_first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), second.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            WsMessage::Close(Some(close)) => assert_eq!(u16::from(close.code), 1013),
            other => panic!("unexpected {other:?}"),
        }
        sos.cancel();
    }
}
