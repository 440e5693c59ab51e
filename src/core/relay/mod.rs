//! Signaling relay.
//!
//! Admits WebSocket connections, scopes discovery to a [`NetworkIdentity`]
//! and forwards handshake and transfer-negotiation messages between devices
//! of the same identity. The relay never sees file contents.

pub mod identity;
pub mod registry;
pub mod server;

use crate::core::config::RelayConfig;
use crate::core::error::ConnectivityError;
use crate::core::protocol::{ClientMessage, ServerMessage};
use axum::http::{header, HeaderMap};
use identity::{IdentityResolver, NetworkIdentity};
use registry::{Presence, Registry};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const TARGET_UNAVAILABLE: &str = "Target device not available or not in the same network";
const EMPTY_NICKNAME: &str = "Nickname must not be empty";

/// A freshly admitted connection.
#[derive(Debug)]
pub struct Admission {
    pub device_id: String,
    pub identity: NetworkIdentity,
    pub outbox: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Counts served by `GET /api/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub devices: usize,
    pub announced: usize,
}

pub struct Relay {
    config: RelayConfig,
    resolver: IdentityResolver,
    registry: Mutex<Registry>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            resolver: IdentityResolver::new(config.mode),
            registry: Mutex::new(Registry::new(config.max_connections)),
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a connection: [`screen`] then [`register`] in one step.
    ///
    /// [`screen`]: Relay::screen
    /// [`register`]: Relay::register
    pub fn admit(
        &self,
        peer: SocketAddr,
        headers: &HeaderMap,
    ) -> Result<Admission, ConnectivityError> {
        let identity = self.screen(peer, headers)?;
        self.register(peer, identity)
    }

    /// Origin and scope checks. Touches no registry state.
    pub fn screen(
        &self,
        peer: SocketAddr,
        headers: &HeaderMap,
    ) -> Result<NetworkIdentity, ConnectivityError> {
        self.check_origin(headers)?;
        self.resolver.resolve(peer, headers)
    }

    /// Capacity check, then register the device silently and send it the
    /// already-announced devices of its network.
    pub fn register(
        &self,
        peer: SocketAddr,
        identity: NetworkIdentity,
    ) -> Result<Admission, ConnectivityError> {
        let (tx, outbox) = mpsc::unbounded_channel();
        let mut registry = self.registry();
        let device_id = registry.join(identity.clone(), tx)?;

        let snapshot: Vec<_> = registry
            .announced_peers(&device_id)
            .iter()
            .map(|d| d.info())
            .collect();
        if let Some(me) = registry.get(&device_id) {
            for device in snapshot {
                me.send(ServerMessage::DeviceDiscovered { device });
            }
        }

        info!(
            event = "device_joined",
            device = %device_id,
            network = %identity,
            peer = %peer,
            connected = registry.len(),
            "Device connected"
        );

        Ok(Admission {
            device_id,
            identity,
            outbox,
        })
    }

    fn check_origin(&self, headers: &HeaderMap) -> Result<(), ConnectivityError> {
        if self.config.cors_origins.is_empty() {
            return Ok(());
        }
        let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            return Ok(());
        };
        let allowed = self
            .config
            .cors_origins
            .iter()
            .any(|o| o == "*" || o.eq_ignore_ascii_case(origin));
        if allowed {
            Ok(())
        } else {
            Err(ConnectivityError::OriginNotAllowed(origin.to_string()))
        }
    }

    /// Decode and dispatch one text frame. Unparseable frames are ignored.
    pub fn handle_text(&self, device_id: &str, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(device_id, msg),
            Err(e) => {
                warn!(
                    event = "relay_bad_frame",
                    device = %device_id,
                    error = %e,
                    "Ignoring unparseable relay message"
                );
            }
        }
    }

    pub fn handle(&self, device_id: &str, msg: ClientMessage) {
        debug!(event = "relay_message", device = %device_id, kind = msg.kind());
        match msg {
            ClientMessage::SetNickname { nickname } => self.set_nickname(device_id, &nickname),
            ClientMessage::Offer {
                offer,
                target_device,
            } => self.forward(
                device_id,
                &target_device.clone(),
                ServerMessage::Offer {
                    offer,
                    target_device,
                    source_device: device_id.to_string(),
                },
            ),
            ClientMessage::Answer {
                answer,
                target_device,
            } => self.forward(
                device_id,
                &target_device.clone(),
                ServerMessage::Answer {
                    answer,
                    target_device,
                    source_device: device_id.to_string(),
                },
            ),
            ClientMessage::IceCandidate {
                candidate,
                target_device,
            } => self.forward(
                device_id,
                &target_device.clone(),
                ServerMessage::IceCandidate {
                    candidate,
                    target_device,
                    source_device: device_id.to_string(),
                },
            ),
            ClientMessage::FileRequest {
                target_device,
                file_name,
                file_size,
                session_id,
                last_chunk_index,
            } => self.file_request(
                device_id,
                target_device,
                file_name,
                file_size,
                session_id,
                last_chunk_index,
            ),
            ClientMessage::FileAccept { source_device } => {
                self.file_response(device_id, &source_device, true)
            }
            ClientMessage::FileReject { source_device } => {
                self.file_response(device_id, &source_device, false)
            }
            ClientMessage::Ping => self.reply(device_id, ServerMessage::Pong),
        }
    }

    fn reply(&self, device_id: &str, msg: ServerMessage) {
        if let Some(device) = self.registry().get(device_id) {
            device.send(msg);
        }
    }

    fn set_nickname(&self, device_id: &str, nickname: &str) {
        let mut registry = self.registry();
        let Some(name) = registry.announce(device_id, nickname) else {
            if let Some(device) = registry.get(device_id) {
                device.send(ServerMessage::error(EMPTY_NICKNAME));
            }
            return;
        };
        let Some(me) = registry.get(device_id).map(|d| d.info()) else {
            return;
        };
        let peers = registry.same_network(device_id);
        for peer in &peers {
            peer.send(ServerMessage::DeviceDiscovered { device: me.clone() });
        }
        info!(
            event = "device_announced",
            device = %device_id,
            name = %name,
            notified = peers.len(),
            "Device announced"
        );
    }

    /// Forward a handshake message. Dropped silently if the target is absent,
    /// closed, or in another network.
    fn forward(&self, source: &str, target: &str, msg: ServerMessage) {
        let registry = self.registry();
        match registry.reachable(source, target) {
            Some(device) => {
                let kind = msg.kind();
                if device.send(msg) {
                    debug!(event = "relay_forward", kind, from = %source, to = %target);
                }
            }
            None => {
                debug!(
                    event = "relay_drop",
                    kind = msg.kind(),
                    from = %source,
                    to = %target,
                    "Dropping message for unreachable target"
                );
            }
        }
    }

    fn file_request(
        &self,
        source: &str,
        target: String,
        file_name: String,
        file_size: u64,
        session_id: Option<String>,
        last_chunk_index: Option<u32>,
    ) {
        let mut registry = self.registry();
        let delivered = registry.reachable(source, &target).is_some_and(|device| {
            device.send(ServerMessage::FileRequest {
                file_name: file_name.clone(),
                file_size,
                source_device: source.to_string(),
                session_id,
                last_chunk_index,
            })
        });

        let Some(requester) = registry.get(source) else {
            return;
        };
        if delivered {
            requester.send(ServerMessage::FileRequestSent {
                target_device: target.clone(),
                file_name: file_name.clone(),
            });
            registry.record_pending(source, &target);
            info!(
                event = "file_request_forwarded",
                from = %source,
                to = %target,
                file = %file_name,
                size = file_size,
            );
        } else {
            requester.send(ServerMessage::error(TARGET_UNAVAILABLE));
            warn!(
                event = "file_request_unroutable",
                from = %source,
                to = %target,
                "File request target unavailable"
            );
        }
    }

    /// `file-accept` / `file-reject` from `responder` about a request sent by
    /// `requester`.
    fn file_response(&self, responder: &str, requester: &str, accepted: bool) {
        let mut registry = self.registry();
        if !registry.take_pending(requester, responder) {
            let kind = if accepted { "file-accept" } else { "file-reject" };
            debug!(
                event = "relay_drop",
                kind,
                from = %responder,
                to = %requester,
                "No pending request for response"
            );
            return;
        }
        let Some(device) = registry.reachable(responder, requester) else {
            return;
        };
        let target_device = responder.to_string();
        device.send(if accepted {
            ServerMessage::FileAccepted { target_device }
        } else {
            ServerMessage::FileRejected { target_device }
        });
        info!(
            event = "file_response_forwarded",
            from = %responder,
            to = %requester,
            accepted,
        );
    }

    /// Remove the device, drop its pending requests and tell same-network
    /// peers it left. Silent devices leave silently.
    pub fn disconnect(&self, device_id: &str) {
        let mut registry = self.registry();
        let peers: Vec<_> = registry
            .same_network(device_id)
            .into_iter()
            .map(|d| d.id.clone())
            .collect();
        let Some(device) = registry.remove(device_id) else {
            return;
        };
        if device.presence == Presence::Announced {
            for peer in peers.iter().filter_map(|id| registry.get(id)) {
                peer.send(ServerMessage::DeviceDisconnected {
                    device_id: device_id.to_string(),
                });
            }
        }
        info!(
            event = "device_left",
            device = %device_id,
            network = %device.identity,
            connected = registry.len(),
            "Device disconnected"
        );
    }

    pub fn status(&self) -> RelayStatus {
        let registry = self.registry();
        RelayStatus {
            devices: registry.len(),
            announced: registry.announced_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DeploymentMode;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn relay() -> Relay {
        Relay::new(RelayConfig {
            mode: DeploymentMode::Production,
            max_connections: 8,
            ..RelayConfig::default()
        })
    }

    fn connect(relay: &Relay, ip: &str) -> Admission {
        relay
            .admit(format!("{ip}:40000").parse().unwrap(), &HeaderMap::new())
            .unwrap()
    }

    fn drain(adm: &mut Admission) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = adm.outbox.try_recv() {
            out.push(msg);
        }
        out
    }

    fn nick(relay: &Relay, adm: &Admission, name: &str) {
        relay.handle(
            &adm.device_id,
            ClientMessage::SetNickname {
                nickname: name.into(),
            },
        );
    }

    #[test]
    fn screening_alone_holds_no_connection_slot() {
        let relay = Relay::new(RelayConfig {
            mode: DeploymentMode::Production,
            max_connections: 1,
            ..RelayConfig::default()
        });
        let peer: SocketAddr = "192.168.1.10:40000".parse().unwrap();
        // Upgrades that were screened but never completed.
        for _ in 0..3 {
            relay.screen(peer, &HeaderMap::new()).unwrap();
        }
        assert_eq!(relay.status().devices, 0);

        let identity = relay.screen(peer, &HeaderMap::new()).unwrap();
        let admitted = relay.register(peer, identity).unwrap();
        assert_eq!(relay.status().devices, 1);

        let identity = relay.screen(peer, &HeaderMap::new()).unwrap();
        assert_eq!(
            relay.register(peer, identity).unwrap_err(),
            ConnectivityError::AtCapacity(1)
        );
        relay.disconnect(&admitted.device_id);
        assert_eq!(relay.status().devices, 0);
    }

    #[test]
    fn screening_rejects_public_addresses_without_registering() {
        let relay = relay();
        let err = relay
            .screen("8.8.8.8:40000".parse().unwrap(), &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::NotAllowed(_)));
        assert_eq!(relay.status().devices, 0);
    }

    #[test]
    fn silent_devices_are_not_announced() {
        let relay = relay();
        let mut a = connect(&relay, "192.168.1.10");
        let mut b = connect(&relay, "192.168.1.11");
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut b).is_empty());

        nick(&relay, &b, "Phone");
        let seen = drain(&mut a);
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            ServerMessage::DeviceDiscovered { device } => {
                assert_eq!(device.id, b.device_id);
                assert_eq!(device.name, "Phone");
            }
            other => panic!("unexpected {other:?}"),
        }
        // Newcomers receive the announced snapshot.
        let mut c = connect(&relay, "192.168.1.12");
        let snapshot = drain(&mut c);
        assert_eq!(snapshot.len(), 1);
        assert!(matches!(
            &snapshot[0],
            ServerMessage::DeviceDiscovered { device } if device.id == b.device_id
        ));
    }

    #[test]
    fn identities_partition_discovery_and_handshakes() {
        let relay = relay();
        let mut a = connect(&relay, "192.168.1.10");
        let mut x = connect(&relay, "10.0.5.10");
        nick(&relay, &a, "A");
        nick(&relay, &x, "X");
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut x).is_empty());

        relay.handle(
            &a.device_id,
            ClientMessage::Offer {
                offer: json!({"sdp": "v=0"}),
                target_device: x.device_id.clone(),
            },
        );
        relay.handle(
            &a.device_id,
            ClientMessage::FileRequest {
                target_device: x.device_id.clone(),
                file_name: "a.bin".into(),
                file_size: 3,
                session_id: None,
                last_chunk_index: None,
            },
        );
        assert!(drain(&mut x).is_empty());
        assert_eq!(
            drain(&mut a),
            vec![ServerMessage::error(TARGET_UNAVAILABLE)]
        );

        relay.disconnect(&a.device_id);
        assert!(drain(&mut x).is_empty());
    }

    #[test]
    fn file_request_round_trip() {
        let relay = relay();
        let mut a = connect(&relay, "192.168.1.10");
        let mut b = connect(&relay, "192.168.1.11");
        nick(&relay, &a, "A");
        nick(&relay, &b, "B");
        drain(&mut a);
        drain(&mut b);

        relay.handle(
            &a.device_id,
            ClientMessage::FileRequest {
                target_device: b.device_id.clone(),
                file_name: "notes.txt".into(),
                file_size: 42,
                session_id: Some("s-1".into()),
                last_chunk_index: Some(4),
            },
        );
        assert_eq!(
            drain(&mut b),
            vec![ServerMessage::FileRequest {
                file_name: "notes.txt".into(),
                file_size: 42,
                source_device: a.device_id.clone(),
                session_id: Some("s-1".into()),
                last_chunk_index: Some(4),
            }]
        );
        assert_eq!(
            drain(&mut a),
            vec![ServerMessage::FileRequestSent {
                target_device: b.device_id.clone(),
                file_name: "notes.txt".into(),
            }]
        );

        relay.handle(
            &b.device_id,
            ClientMessage::FileAccept {
                source_device: a.device_id.clone(),
            },
        );
        assert_eq!(
            drain(&mut a),
            vec![ServerMessage::FileAccepted {
                target_device: b.device_id.clone()
            }]
        );

        // A second accept without a new request is not forwarded.
        relay.handle(
            &b.device_id,
            ClientMessage::FileReject {
                source_device: a.device_id.clone(),
            },
        );
        assert!(drain(&mut a).is_empty());
    }

    #[test]
    fn handshake_messages_carry_source_device() {
        let relay = relay();
        let a = connect(&relay, "192.168.1.10");
        let mut b = connect(&relay, "192.168.1.11");
        relay.handle(
            &a.device_id,
            ClientMessage::IceCandidate {
                candidate: json!({"candidate": "candidate:1 1 udp 1 192.168.1.10 5000 typ host"}),
                target_device: b.device_id.clone(),
            },
        );
        match drain(&mut b).pop() {
            Some(ServerMessage::IceCandidate { source_device, .. }) => {
                assert_eq!(source_device, a.device_id)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disconnect_notifies_same_network_only() {
        let relay = relay();
        let a = connect(&relay, "192.168.1.10");
        let mut b = connect(&relay, "192.168.1.11");
        let mut x = connect(&relay, "10.0.0.1");
        nick(&relay, &a, "A");
        drain(&mut b);
        drain(&mut x);

        relay.disconnect(&a.device_id);
        assert_eq!(
            drain(&mut b),
            vec![ServerMessage::DeviceDisconnected {
                device_id: a.device_id.clone()
            }]
        );
        assert!(drain(&mut x).is_empty());
        assert_eq!(
            relay.status(),
            RelayStatus {
                devices: 2,
                announced: 0
            }
        );
    }

    #[test]
    fn ping_gets_pong_and_garbage_is_ignored() {
        let relay = relay();
        let mut a = connect(&relay, "127.0.0.1");
        relay.handle_text(&a.device_id, "{not json");
        relay.handle_text(&a.device_id, r#"{"type":"ping"}"#);
        assert_eq!(drain(&mut a), vec![ServerMessage::Pong]);
    }

    #[test]
    fn empty_nickname_is_refused() {
        let relay = relay();
        let mut a = connect(&relay, "192.168.1.10");
        let mut b = connect(&relay, "192.168.1.11");
        nick(&relay, &a, "  ");
        assert_eq!(drain(&mut a), vec![ServerMessage::error(EMPTY_NICKNAME)]);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn unlisted_origin_is_refused() {
        let relay = Relay::new(RelayConfig {
            cors_origins: vec!["http://lan.local".into()],
            ..RelayConfig::default()
        });
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://evil.example"));
        let err = relay
            .admit("127.0.0.1:1".parse().unwrap(), &headers)
            .err()
            .unwrap();
        assert_eq!(
            err,
            ConnectivityError::OriginNotAllowed("http://evil.example".into())
        );

        headers.insert(header::ORIGIN, HeaderValue::from_static("http://lan.local"));
        assert!(relay.admit("127.0.0.1:1".parse().unwrap(), &headers).is_ok());
    }
}
