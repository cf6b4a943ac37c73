//! Rust SDK for the Arena esports dashboard live stream.
//!
//! The crate is organized by concern:
//! - `stream`: realtime websocket client with bounded automatic reconnects,
//!   message history and lifecycle callbacks.
//! - `retry`: fixed-interval reconnect policy and timeout helpers.

/// Reconnect policy and timeout helpers.
pub mod retry;
/// Realtime stream client, wire envelope, history and transport.
pub mod stream;

pub use stream::client::{
    ConnectionState, StreamClient, StreamClientBuilder, StreamClientError, StreamClientOptions,
    StreamConnectionStatus, StreamHandlers, WeakStreamClient,
};
pub use stream::proto::StreamMessage;
