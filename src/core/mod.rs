pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod handshake;
pub mod persistence;
pub mod pipeline;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod signaling;
