//! A remote peer we dial.
//!
//! A [`Node`] is the bookkeeping for one configured peer address: whether
//! we are connected to it, which partners it announced, which other nodes
//! are reachable through it, and how long to wait before the next attempt
//! after a failure. The dialing itself is driven by
//! [`NodeRegistry`](crate::NodeRegistry), which sees every node at once.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use trapsync_messager::Stats;
use trapsync_protocol::PeerSet;
use trapsync_session::{Session, SessionState};
use trapsync_transport::{ConnectionId, TcpConnection};

use crate::{NodeConfig, NodeError};

/// Session type used for every outbound node connection.
pub type NodeSession = Session<TcpConnection>;

/// Read-only snapshot of a node, as shown in status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub address: SocketAddr,
    pub delay: Duration,
    pub stats: Stats,
    pub connected: bool,
    pub partners: PeerSet,
}

struct Link {
    session: Arc<NodeSession>,
    heartbeat: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct NodeState {
    link: Option<Link>,
    connecting: bool,
    /// Addresses the peer is connected with, itself included.
    partners: PeerSet,
    /// Registered nodes reachable through this one while it is connected.
    excludes: PeerSet,
    failures: u32,
    next_connect_after: Option<Instant>,
}

/// One configured peer.
pub struct Node {
    address: SocketAddr,
    passphrase: String,
    state: Mutex<NodeState>,
}

impl Node {
    pub fn new(address: SocketAddr, passphrase: impl Into<String>) -> Self {
        Self {
            address,
            passphrase: passphrase.into(),
            state: Mutex::new(NodeState::default()),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// `true` once the peer accepted our `HELLO`, until the session ends.
    pub fn is_connected(&self) -> bool {
        self.lock().link.is_some()
    }

    pub fn session(&self) -> Option<Arc<NodeSession>> {
        self.lock().link.as_ref().map(|l| Arc::clone(&l.session))
    }

    pub fn partners(&self) -> PeerSet {
        self.lock().partners.clone()
    }

    pub fn is_partner(&self, addr: &SocketAddr) -> bool {
        self.lock().partners.contains(addr)
    }

    /// Nodes reachable through this one.
    pub fn excludes(&self) -> PeerSet {
        self.lock().excludes.clone()
    }

    /// Whether `addr` is reachable through this node right now.
    pub fn is_excluding(&self, addr: &SocketAddr) -> bool {
        let state = self.lock();
        state.link.is_some() && state.excludes.contains(addr)
    }

    /// Consecutive failed attempts.
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// How long until the next attempt is allowed, if we are backing off.
    pub fn retry_wait(&self, now: Instant) -> Option<Duration> {
        self.lock()
            .next_connect_after
            .filter(|after| now <= *after)
            .map(|after| after - now)
    }

    /// Not connected, not connecting, and not backing off. Mesh
    /// exclusion is checked by the registry.
    pub fn is_reconnectable(&self) -> bool {
        let state = self.lock();
        state.link.is_none()
            && !state.connecting
            && state
                .next_connect_after
                .is_none_or(|after| Instant::now() > after)
    }

    pub fn delay(&self) -> Duration {
        self.session().map(|s| s.delay()).unwrap_or_default()
    }

    pub fn stats(&self) -> Stats {
        self.session().map(|s| s.stats()).unwrap_or_default()
    }

    pub fn info(&self) -> NodeInfo {
        let session = self.session();
        NodeInfo {
            address: self.address,
            delay: session.as_ref().map(|s| s.delay()).unwrap_or_default(),
            stats: session.as_ref().map(|s| s.stats()).unwrap_or_default(),
            connected: session.is_some(),
            partners: self.partners(),
        }
    }

    // -----------------------------------------------------------------------
    // Transitions driven by the registry
    // -----------------------------------------------------------------------

    /// Claims the node for a connection attempt.
    pub(crate) fn begin_connect(&self, now: Instant) -> Result<(), NodeError> {
        let mut state = self.lock();
        if state.link.is_some() || state.connecting {
            return Err(NodeError::AlreadyConnected(self.address));
        }
        if let Some(after) = state.next_connect_after {
            if now <= after {
                return Err(NodeError::RetryAfterTime {
                    addr: self.address,
                    wait: after - now,
                });
            }
        }
        state.connecting = true;
        Ok(())
    }

    /// Records a failed attempt started at `started` and returns the wait
    /// before the next one: one retry period per consecutive failure,
    /// capped.
    pub(crate) fn record_failure(&self, started: Instant, config: &NodeConfig) -> Duration {
        let mut state = self.lock();
        state.connecting = false;
        state.failures = state.failures.saturating_add(1);
        let wait = config
            .retry_period()
            .saturating_mul(state.failures)
            .min(config.max_retry_period());
        state.next_connect_after = Some(started + wait);
        wait
    }

    /// Installs an authenticated session.
    pub(crate) fn attach(&self, session: Arc<NodeSession>, partners: PeerSet, excludes: PeerSet) {
        let mut state = self.lock();
        state.link = Some(Link {
            session,
            heartbeat: None,
        });
        state.connecting = false;
        state.partners = partners;
        state.excludes = excludes;
        state.failures = 0;
        state.next_connect_after = None;
    }

    pub(crate) fn set_heartbeat(&self, id: ConnectionId, handle: JoinHandle<()>) {
        let mut state = self.lock();
        match state.link.as_mut() {
            Some(link) if link.session.id() == id => link.heartbeat = Some(handle),
            _ => handle.abort(),
        }
    }

    /// Drops the session `id` if it is the current one, returning the
    /// partners it had.
    pub(crate) fn detach(&self, id: ConnectionId) -> Option<PeerSet> {
        let mut state = self.lock();
        if state.link.as_ref().map(|l| l.session.id()) != Some(id) {
            return None;
        }
        if let Some(Link {
            heartbeat: Some(heartbeat),
            ..
        }) = state.link.take()
        {
            heartbeat.abort();
        }
        state.excludes.clear();
        Some(std::mem::take(&mut state.partners))
    }

    /// `true` if the current session has already ended.
    pub(crate) fn is_stale(&self) -> bool {
        self.session()
            .is_some_and(|s| s.state() == SessionState::Closed)
    }

    pub(crate) fn add_partners(&self, added: &PeerSet, excludes: &PeerSet) {
        let mut state = self.lock();
        state.partners.extend_from(added);
        state.excludes.extend_from(excludes);
    }

    pub(crate) fn remove_partners(&self, removed: &PeerSet) {
        let mut state = self.lock();
        state.partners.subtract(removed);
        state.excludes.subtract(removed);
    }

    pub(crate) fn add_exclude(&self, addr: SocketAddr) {
        self.lock().excludes.insert(addr);
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
