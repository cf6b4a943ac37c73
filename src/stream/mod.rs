//! Realtime stream client modules.

/// Stream client handle, options, callbacks and the connection worker.
pub mod client;
/// Bounded message history.
pub mod history;
/// Stream wire envelope and JSON frame codec.
pub mod proto;
/// Connector seam and websocket transport.
pub mod transport;
