//! Error types for the node layer.

use std::net::SocketAddr;
use std::time::Duration;

use trapsync_session::SessionError;
use trapsync_transport::TransportError;

/// Errors that can occur while managing outbound nodes.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node {0} is already registered")]
    AlreadyExisted(SocketAddr),

    #[error("node {0} is not registered")]
    NotExisted(SocketAddr),

    /// The node is connected, or a connection attempt is in progress.
    #[error("node {0} is already connected")]
    AlreadyConnected(SocketAddr),

    #[error("node {0} is not connected")]
    NotConnected(SocketAddr),

    /// The node is reachable through another connected node.
    #[error("node {0} is reachable through another node")]
    IsMutexed(SocketAddr),

    /// The node failed recently and is backing off.
    #[error("node {addr} may be retried in {wait:?}")]
    RetryAfterTime { addr: SocketAddr, wait: Duration },

    /// Dialing failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The handshake or a request failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}
