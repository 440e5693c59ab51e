//! Chunked transfer pipeline: wire framing, the flow-controlled sender and
//! the reassembling receiver.

pub mod chunk;
pub mod receiver;
pub mod sender;
