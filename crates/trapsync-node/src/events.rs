//! What nodes report upward, and the dialer hooks that report it.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use tracing::debug;

use trapsync_protocol::{ClientRecord, PeerSet};
use trapsync_session::{DialerHooks, Propagation, SessionError};
use trapsync_transport::ConnectionId;

use crate::NodeRegistry;

/// Receiver of mesh changes seen through node connections.
///
/// Called from connection read tasks; implementations must not block and
/// should spawn anything that talks to other connections.
pub trait MeshEvents: Send + Sync + 'static {
    /// A node connection gained `partners` (after `HELLO`, or through
    /// `PARTNER_ADD`).
    fn partners_added(&self, origin: ConnectionId, partners: PeerSet);

    /// A node connection lost `partners` (through `PARTNER_REMOVE`, or on
    /// disconnect).
    fn partners_removed(&self, origin: ConnectionId, partners: PeerSet);

    /// A node forwarded client marks.
    fn clients_marked(
        &self,
        origin: ConnectionId,
        records: Vec<ClientRecord>,
    ) -> Result<(), SessionError>;

    /// A node forwarded client unmarks.
    fn clients_unmarked(&self, origin: ConnectionId, ips: Vec<IpAddr>) -> Result<(), SessionError>;
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl MeshEvents for NoEvents {
    fn partners_added(&self, _origin: ConnectionId, _partners: PeerSet) {}

    fn partners_removed(&self, _origin: ConnectionId, _partners: PeerSet) {}

    fn clients_marked(
        &self,
        _origin: ConnectionId,
        _records: Vec<ClientRecord>,
    ) -> Result<(), SessionError> {
        Ok(())
    }

    fn clients_unmarked(
        &self,
        _origin: ConnectionId,
        _ips: Vec<IpAddr>,
    ) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Dialer hooks of one node's session.
pub(crate) struct NodeHooks {
    pub(crate) registry: Weak<NodeRegistry>,
    pub(crate) node: SocketAddr,
}

impl NodeHooks {
    fn registry(&self) -> Result<Arc<NodeRegistry>, SessionError> {
        self.registry
            .upgrade()
            .ok_or_else(|| SessionError::Rejected("node registry is gone".into()))
    }
}

impl Propagation for NodeHooks {
    fn partners(&self) -> PeerSet {
        self.registry
            .upgrade()
            .map(|r| r.partners())
            .unwrap_or_default()
    }

    fn mark_clients(
        &self,
        origin: ConnectionId,
        records: Vec<ClientRecord>,
    ) -> Result<(), SessionError> {
        self.registry()?.events().clients_marked(origin, records)
    }

    fn unmark_clients(&self, origin: ConnectionId, ips: Vec<IpAddr>) -> Result<(), SessionError> {
        self.registry()?.events().clients_unmarked(origin, ips)
    }
}

impl DialerHooks for NodeHooks {
    fn partners_added(&self, origin: ConnectionId, added: PeerSet) -> Result<(), SessionError> {
        let registry = self.registry()?;
        let node = registry
            .get(self.node)
            .ok_or_else(|| SessionError::Rejected(format!("node {} was removed", self.node)))?;
        let excludes = registry.registered_among(&added, self.node);
        node.add_partners(&added, &excludes);
        debug!(node = %self.node, added = added.len(), "node gained partners");
        registry.events().partners_added(origin, added);
        Ok(())
    }

    fn partners_removed(&self, origin: ConnectionId, removed: PeerSet) -> Result<(), SessionError> {
        let registry = self.registry()?;
        let node = registry
            .get(self.node)
            .ok_or_else(|| SessionError::Rejected(format!("node {} was removed", self.node)))?;
        node.remove_partners(&removed);
        debug!(node = %self.node, removed = removed.len(), "node lost partners");
        registry.events().partners_removed(origin, removed);
        Ok(())
    }

    fn partners_conflicted(&self, _origin: ConnectionId, conflicted: PeerSet) {
        if let Some(registry) = self.registry.upgrade() {
            registry.exclude_through_partners(self.node, &conflicted);
        }
    }
}
