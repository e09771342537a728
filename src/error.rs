//! Error taxonomy for RPC operations.

use crate::codec::ProtocolError;

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors that can occur during RPC operations.
///
/// Transport and codec errors from synchronous calls propagate to the
/// caller; consume-path errors are logged and swallowed so the dispatch
/// loops stay alive.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Topology setup failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Registration is closed once listen() has started")]
    AlreadyListening,

    #[error("Handler failed: {0}")]
    Handler(String),
}
