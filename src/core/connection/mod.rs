pub mod channel;
#[cfg(test)]
pub mod mock;
pub mod webrtc;

pub use channel::{is_host_candidate, PeerChannel, PeerConnection, PeerConnector, PeerEvent};
pub use webrtc::WebRtcConnector;
