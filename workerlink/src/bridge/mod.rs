//! Wire layer between the host and the worker process.
//!
//! - **protocol**: Request envelope and inbound frame types
//! - **codec**: JSON text-frame encoding over WebSocket messages
//! - **transport**: WebSocket connection with reader/writer tasks

pub mod codec;
pub mod protocol;
pub mod transport;
