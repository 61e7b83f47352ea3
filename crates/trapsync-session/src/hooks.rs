//! Collaborator traits the controllers call into.
//!
//! The session layer knows the protocol but not the mesh: which partners
//! we have, where propagated clients go, and what an authenticated peer
//! means for the rest of the process. Those answers come from the
//! implementor of these traits (the node registry and the sync
//! orchestrator above this crate).
//!
//! Hooks are synchronous. They run on the connection's read task, so
//! anything that talks to *other* connections (re-broadcasting a mark,
//! for example) must be spawned rather than awaited inline.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use trapsync_protocol::{ClientRecord, PeerSet};
use trapsync_transport::ConnectionId;

use crate::SessionError;

/// Hooks shared by both ends of a session.
pub trait Propagation: Send + Sync + 'static {
    /// Every address this process is currently connected with, through any
    /// node. Offered in `HELLO` and checked for conflicts.
    fn partners(&self) -> PeerSet;

    /// Applies client marks received from `origin`.
    ///
    /// An error makes the controller answer `CLIENT_MARK_DENIED` and close
    /// the connection.
    fn mark_clients(
        &self,
        origin: ConnectionId,
        records: Vec<ClientRecord>,
    ) -> Result<(), SessionError>;

    /// Applies client unmarks received from `origin`.
    fn unmark_clients(&self, origin: ConnectionId, ips: Vec<IpAddr>) -> Result<(), SessionError>;
}

/// Hooks for the side that accepted the connection.
pub trait AcceptorHooks: Propagation {
    /// Passphrase a dialer must present in `HELLO`.
    fn passphrase(&self) -> String;

    /// Idle deadline applied once a dialer authenticates. Half of it is
    /// handed out as the heartbeat period.
    fn loose_timeout(&self) -> Duration;

    /// Called after `HELLO_ACCEPT` was written.
    fn on_authed(&self, _id: ConnectionId, _peer: SocketAddr) {}

    /// Called on a wrong passphrase or a partner conflict.
    fn on_auth_failed(&self, _peer: SocketAddr) {}
}

/// Hooks for the side that dialed the connection.
pub trait DialerHooks: Propagation {
    /// The acceptor gained partners.
    fn partners_added(&self, origin: ConnectionId, added: PeerSet) -> Result<(), SessionError>;

    /// The acceptor lost partners.
    fn partners_removed(&self, origin: ConnectionId, removed: PeerSet)
    -> Result<(), SessionError>;

    /// The acceptor announced partners we already reach another way. The
    /// connection is closed after this call.
    fn partners_conflicted(&self, _origin: ConnectionId, _conflicted: PeerSet) {}
}
