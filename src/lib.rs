//! LanShare: a LAN-scoped signaling relay and resumable, chunked WebRTC file
//! transfer between the devices it introduces.

pub mod core;
pub mod utils;
pub mod workers;
