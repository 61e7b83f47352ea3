//! Error types for the session layer.

use std::net::SocketAddr;

use trapsync_messager::MessagerError;
use trapsync_protocol::PeerSet;
use trapsync_transport::ConnectionId;

/// Errors that can occur while running a session.
///
/// The `*Denied` variants mean the peer answered with the matching
/// `_DENIED` code; the connection is usually closed right after.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The peer refused our `HELLO`: wrong passphrase, or we were already
    /// authenticated.
    #[error("authentication denied by {0}")]
    AuthFailedDenied(SocketAddr),

    /// The peer already reaches some of our partners. Not a hard failure:
    /// the caller should avoid the redundant edge.
    #[error("{peer} already shares {} partner(s) with us", partners.len())]
    AuthFailedConflicted { peer: SocketAddr, partners: PeerSet },

    #[error("heartbeat denied by {0}")]
    HeartbeatDenied(SocketAddr),

    #[error("partner add denied by {0}")]
    PartnerAddDenied(SocketAddr),

    #[error("partner remove denied by {0}")]
    PartnerRemoveDenied(SocketAddr),

    #[error("client mark denied by {0}")]
    ClientMarkDenied(SocketAddr),

    #[error("client unmark denied by {0}")]
    ClientUnmarkDenied(SocketAddr),

    /// A session with this connection id is already registered.
    #[error("session {0} is already registered")]
    SessionAlreadyRegistered(ConnectionId),

    /// No session with this connection id is registered.
    #[error("session {0} is not registered")]
    SessionNotRegistered(ConnectionId),

    /// A local hook refused to apply a propagated change.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The underlying messager failed.
    #[error(transparent)]
    Messager(#[from] MessagerError),
}
