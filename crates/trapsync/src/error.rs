//! Unified error type for trapsync.

use trapsync_messager::MessagerError;
use trapsync_node::NodeError;
use trapsync_protocol::ProtocolError;
use trapsync_session::SessionError;
use trapsync_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each layer variant lets `?` convert
/// sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TrapError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Messager(#[from] MessagerError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Node(#[from] NodeError),

    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON for [`SyncConfig`](crate::SyncConfig).
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    /// A [`ClientSink`](crate::ClientSink) refused a record.
    #[error("client sink rejected: {0}")]
    Rejected(String),

    /// [`TrapSync::serve`](crate::TrapSync::serve) was called twice.
    #[error("sync server is already running")]
    AlreadyServing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let trap_err: TrapError = err.into();
        assert!(matches!(trap_err, TrapError::Transport(_)));
        assert!(trap_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_node_error() {
        let err = NodeError::NotConnected("127.0.0.1:1".parse().unwrap());
        let trap_err: TrapError = err.into();
        assert!(matches!(trap_err, TrapError::Node(_)));
        assert!(trap_err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn test_from_json_error() {
        let err = serde_json::from_str::<u8>("nope").unwrap_err();
        let trap_err: TrapError = err.into();
        assert!(matches!(trap_err, TrapError::Config(_)));
    }
}
