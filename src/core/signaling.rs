//! Client side of the relay socket.
//!
//! Connects with the `ws` sub-protocol, announces the nickname and then pumps
//! JSON frames between the socket and a pair of channels until either side
//! goes away or the stop signal fires.

use crate::core::config::{RELAY_CONNECT_MAX_ATTEMPTS, RELAY_CONNECT_RETRY_DELAY};
use crate::core::error::ConnectivityError;
use crate::core::protocol::{ClientMessage, ServerMessage};
use crate::utils::sos::SignalOfStop;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Both ends of an established relay session.
pub struct RelaySession {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Connect with the default retry policy.
pub async fn connect(
    url: &str,
    nickname: &str,
    sos: SignalOfStop,
) -> Result<RelaySession, ConnectivityError> {
    connect_with(
        url,
        nickname,
        RELAY_CONNECT_MAX_ATTEMPTS,
        RELAY_CONNECT_RETRY_DELAY,
        sos,
    )
    .await
}

pub async fn connect_with(
    url: &str,
    nickname: &str,
    attempts: u32,
    retry_delay: Duration,
    sos: SignalOfStop,
) -> Result<RelaySession, ConnectivityError> {
    let mut socket = open_socket(url, attempts.max(1), retry_delay).await?;

    let hello = ClientMessage::SetNickname {
        nickname: nickname.to_string(),
    };
    send_json(&mut socket, &hello)
        .await
        .map_err(|_| ConnectivityError::Closed)?;

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    tokio::spawn(pump(socket, outbound_rx, inbound_tx, sos));

    Ok(RelaySession { outbound, inbound })
}

async fn open_socket(url: &str, attempts: u32, retry_delay: Duration) -> Result<Socket, ConnectivityError> {
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let mut request = url.into_client_request().map_err(|e| ConnectivityError::Unreachable {
            url: url.to_string(),
            attempts: attempt,
            reason: e.to_string(),
        })?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("ws"));

        match connect_async(request).await {
            Ok((socket, _)) => {
                info!(event = "relay_connected", url, attempt, "Connected to relay");
                return Ok(socket);
            }
            Err(e) => {
                warn!(event = "relay_connect_failure", url, attempt, error = %e);
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
    error!(event = "relay_unreachable", url, attempts, "Giving up on relay");
    Err(ConnectivityError::Unreachable {
        url: url.to_string(),
        attempts,
        reason: last_error,
    })
}

async fn send_json(socket: &mut Socket, msg: &ClientMessage) -> anyhow::Result<()> {
    let text = serde_json::to_string(msg)?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn pump(
    socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    sos: SignalOfStop,
) {
    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            _ = sos.wait() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(event = "relay_encode_failure", kind = msg.kind(), error = %e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!(event = "relay_send_failure", kind = msg.kind(), error = %e);
                    break;
                }
                debug!(event = "relay_sent", kind = msg.kind());
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            debug!(event = "relay_received", kind = msg.kind());
                            if inbound.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(event = "relay_malformed_message", error = %e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(event = "relay_closed", reason = ?frame, "Relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(event = "relay_socket_error", error = %e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    debug!(event = "relay_pump_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RelayConfig;
    use crate::core::relay::{server::serve_on, Relay};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn start_relay() -> (String, SignalOfStop) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sos = SignalOfStop::new();
        let relay = Arc::new(Relay::new(RelayConfig::default()));
        tokio::spawn(serve_on(listener, relay, sos.clone()));
        (format!("ws://{addr}/ws"), sos)
    }

    async fn recv(session: &mut RelaySession) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), session.inbound.recv())
            .await
            .expect("timed out waiting for relay")
            .expect("relay session ended")
    }

    #[tokio::test]
    async fn announced_clients_see_each_other() {
        let (url, sos) = start_relay().await;
        let mut first = connect(&url, "Alpha", sos.clone()).await.unwrap();
        // Wait for the relay to process Alpha's nickname before Beta joins.
        first.outbound.send(ClientMessage::Ping).unwrap();
        assert_eq!(recv(&mut first).await, ServerMessage::Pong);

        let mut second = connect(&url, "Beta", sos.clone()).await.unwrap();
        match recv(&mut second).await {
            ServerMessage::DeviceDiscovered { device } => assert_eq!(device.name, "Alpha"),
            other => panic!("unexpected {other:?}"),
        }
        match recv(&mut first).await {
            ServerMessage::DeviceDiscovered { device } => assert_eq!(device.name, "Beta"),
            other => panic!("unexpected {other:?}"),
        }
        sos.cancel();
    }

    #[tokio::test]
    async fn stop_signal_ends_the_session() {
        let (url, relay_sos) = start_relay().await;
        let client_sos = SignalOfStop::new();
        let mut session = connect(&url, "Gamma", client_sos.clone()).await.unwrap();
        client_sos.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), session.inbound.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        relay_sos.cancel();
    }

    #[tokio::test]
    async fn unreachable_relay_reports_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = format!("ws://{addr}/ws");
        let err = connect_with(&url, "x", 2, Duration::from_millis(10), SignalOfStop::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectivityError::Unreachable { attempts: 2, .. }));
    }
}
