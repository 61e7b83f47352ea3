//! The set of configured nodes and the logic that dials them.
//!
//! # Mesh exclusion
//!
//! Every node keeps the set of *other* registered nodes it is known to
//! reach. While that node stays connected, the nodes in its set are not
//! dialed: the mesh already links us to them through it.
//!
//! ```text
//!   us ──▶ N ── M          N announces M as a partner
//!                          → M is excluded through N
//!                          → connect(M) fails with IsMutexed
//! ```
//!
//! Our own advertised address travels in every `HELLO` next to the
//! partners. A peer that already reaches us answers `HELLO_CONFLICT`, which
//! keeps a ring from closing.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use trapsync_protocol::{ClientRecord, PeerSet};
use trapsync_session::{BROADCAST_ATTEMPTS, Role, Session, SessionConfig, SessionError, controller};
use trapsync_transport::{ConnectionId, dial};

use crate::events::NodeHooks;
use crate::{MeshEvents, Node, NodeConfig, NodeError, NodeInfo, NodeSession};

/// All configured nodes, keyed by address.
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<SocketAddr, Arc<Node>>>,
    local: Mutex<Option<SocketAddr>>,
    config: NodeConfig,
    events: Arc<dyn MeshEvents>,
}

impl NodeRegistry {
    pub fn new(config: NodeConfig, events: Arc<dyn MeshEvents>) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(BTreeMap::new()),
            local: Mutex::new(None),
            config: config.validated(),
            events,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn events(&self) -> &Arc<dyn MeshEvents> {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Adds a node to dial.
    ///
    /// # Errors
    /// [`NodeError::AlreadyExisted`] if `address` is registered.
    pub fn register(
        &self,
        address: SocketAddr,
        passphrase: impl Into<String>,
    ) -> Result<Arc<Node>, NodeError> {
        let mut nodes = self.write();
        if nodes.contains_key(&address) {
            return Err(NodeError::AlreadyExisted(address));
        }
        let node = Arc::new(Node::new(address, passphrase));
        nodes.insert(address, Arc::clone(&node));
        info!(node = %address, "node registered");
        Ok(node)
    }

    /// Disconnects and forgets a node.
    ///
    /// # Errors
    /// [`NodeError::NotExisted`] if `address` is not registered.
    pub async fn remove(&self, address: SocketAddr) -> Result<(), NodeError> {
        let node = self.get(address).ok_or(NodeError::NotExisted(address))?;
        if node.is_connected() {
            self.disconnect(address).await?;
        }
        self.write().remove(&address);
        info!(node = %address, "node removed");
        Ok(())
    }

    pub fn get(&self, address: SocketAddr) -> Option<Arc<Node>> {
        self.read().get(&address).cloned()
    }

    /// Every node, in address order.
    pub fn scan(&self) -> Vec<Arc<Node>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn infos(&self) -> Vec<NodeInfo> {
        self.scan().iter().map(|n| n.info()).collect()
    }

    // -----------------------------------------------------------------------
    // Partners and exclusion
    // -----------------------------------------------------------------------

    /// Union of every node's partners.
    pub fn partners(&self) -> PeerSet {
        let mut all = PeerSet::new();
        for node in self.scan() {
            all.extend_from(&node.partners());
        }
        all
    }

    /// Sets the address peers know us by. `None` declares partners only.
    pub fn set_local_address(&self, address: Option<SocketAddr>) {
        *self.local.lock().unwrap_or_else(|e| e.into_inner()) = address;
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// What we declare in `HELLO`: every partner plus our own address.
    pub fn declared_partners(&self) -> PeerSet {
        let mut declared = self.partners();
        if let Some(local) = self.local_address() {
            declared.insert(local);
        }
        declared
    }

    pub fn has_partner(&self, addr: &SocketAddr) -> bool {
        self.scan().iter().any(|n| n.is_partner(addr))
    }

    /// `true` while some connected node reaches `address`.
    pub fn is_mutexed(&self, address: SocketAddr) -> bool {
        self.scan()
            .iter()
            .any(|n| n.address() != address && n.is_excluding(&address))
    }

    /// Whether [`connect`](Self::connect) would try to dial `address` now.
    pub fn is_reconnectable(&self, address: SocketAddr) -> bool {
        self.get(address)
            .is_some_and(|n| n.is_reconnectable() && !self.is_mutexed(address))
    }

    /// Registered node addresses in `set`, other than `except`.
    pub(crate) fn registered_among(&self, set: &PeerSet, except: SocketAddr) -> PeerSet {
        self.read()
            .keys()
            .filter(|addr| **addr != except && set.contains(addr))
            .copied()
            .collect()
    }

    /// `node` turned out to be reachable through every node that lists one
    /// of `conflicted` as a partner.
    pub(crate) fn exclude_through_partners(&self, node: SocketAddr, conflicted: &PeerSet) {
        for other in self.scan() {
            if other.address() == node {
                continue;
            }
            if conflicted.iter().any(|p| other.is_partner(p)) {
                debug!(node = %node, through = %other.address(), "node reachable through another node");
                other.add_exclude(node);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connecting
    // -----------------------------------------------------------------------

    /// Dials and authenticates with `address`.
    ///
    /// A failed dial or handshake, including `HELLO_CONFLICT`, starts
    /// backoff. A conflict additionally marks the node as reachable through
    /// the nodes that share the conflicting partners.
    ///
    /// # Errors
    /// - [`NodeError::NotExisted`], [`NodeError::AlreadyConnected`],
    ///   [`NodeError::IsMutexed`], [`NodeError::RetryAfterTime`] without
    ///   dialing
    /// - [`NodeError::Transport`] / [`NodeError::Session`] when the attempt
    ///   fails
    pub async fn connect(self: &Arc<Self>, address: SocketAddr) -> Result<(), NodeError> {
        let node = self.get(address).ok_or(NodeError::NotExisted(address))?;
        if node.is_connected() {
            return Err(NodeError::AlreadyConnected(address));
        }
        if self.is_mutexed(address) {
            return Err(NodeError::IsMutexed(address));
        }
        let started = Instant::now();
        node.begin_connect(started)?;

        match self.establish(&node).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let NodeError::Session(SessionError::AuthFailedConflicted { partners, .. }) = &e {
                    self.exclude_through_partners(address, partners);
                }
                let wait = node.record_failure(started, &self.config);
                warn!(node = %address, error = %e, retry_in = ?wait, "connection attempt failed");
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>, node: &Arc<Node>) -> Result<(), NodeError> {
        let address = node.address();
        let conn = dial(address, self.config.connection_timeout).await?;
        let session = Session::new(
            conn,
            Role::Dialer,
            SessionConfig {
                request_timeout: self.config.request_timeout,
                max_receive_length: self.config.max_receive_length,
            },
        );

        let hooks = Arc::new(NodeHooks {
            registry: Arc::downgrade(self),
            node: address,
        });
        let responders = controller::dialer(&session, hooks);
        let weak = Arc::downgrade(self);
        let serving = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = serving.serve(responders).await {
                debug!(node = %address, error = %e, "node session failed");
            }
            if let Some(registry) = weak.upgrade() {
                registry.detached(address, serving.id());
            }
        });

        let accepted = match session.auth(node.passphrase(), self.declared_partners()).await {
            Ok(accepted) => accepted,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        let mut partners = accepted.partners;
        partners.insert(address);
        let excludes = self.registered_among(&partners, address);
        node.attach(Arc::clone(&session), partners.clone(), excludes);
        if node.is_stale() {
            self.detached(address, session.id());
            return Err(NodeError::NotConnected(address));
        }

        let period = if accepted.heartbeat_period.is_zero() {
            self.config.connection_timeout / 2
        } else {
            accepted.heartbeat_period
        };
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&session), address, period));
        node.set_heartbeat(session.id(), heartbeat);

        info!(node = %address, conn = %session.id(), partners = partners.len(), "node connected");
        self.events.partners_added(session.id(), partners);
        Ok(())
    }

    /// Clears a node after its session `id` ended.
    fn detached(&self, address: SocketAddr, id: ConnectionId) {
        let Some(node) = self.get(address) else {
            return;
        };
        if let Some(old) = node.detach(id) {
            info!(node = %address, conn = %id, "node disconnected");
            if !old.is_empty() {
                self.events.partners_removed(id, old);
            }
        }
    }

    /// Says `BYE` to a connected node.
    ///
    /// # Errors
    /// [`NodeError::NotConnected`] if it is not connected.
    pub async fn disconnect(&self, address: SocketAddr) -> Result<(), NodeError> {
        let node = self.get(address).ok_or(NodeError::NotExisted(address))?;
        let session = node.session().ok_or(NodeError::NotConnected(address))?;
        if let Err(e) = session.bye().await {
            debug!(node = %address, error = %e, "bye failed");
        }
        self.detached(address, session.id());
        Ok(())
    }

    /// Tries every reconnectable node, one after another so that each
    /// success can exclude the nodes behind it. Returns how many connected.
    pub async fn connect_all(self: &Arc<Self>) -> usize {
        let mut connected = 0;
        for node in self.scan() {
            let address = node.address();
            if !self.is_reconnectable(address) {
                trace!(node = %address, "not reconnectable, skipping");
                continue;
            }
            match self.connect(address).await {
                Ok(()) => connected += 1,
                Err(e) => debug!(node = %address, error = %e, "connect skipped"),
            }
        }
        connected
    }

    pub async fn disconnect_all(&self) {
        let connected: Vec<_> = self
            .scan()
            .into_iter()
            .filter(|n| n.is_connected())
            .collect();
        join_all(connected.iter().map(|n| async move {
            if let Err(e) = self.disconnect(n.address()).await {
                debug!(node = %n.address(), error = %e, "disconnect failed");
            }
        }))
        .await;
    }

    /// Disconnects and forgets every node.
    pub async fn clear(&self) {
        self.disconnect_all().await;
        self.write().clear();
    }

    // -----------------------------------------------------------------------
    // Fan-out
    // -----------------------------------------------------------------------

    /// Runs `op` against every connected node whose session is not in
    /// `excludes`, all at once, trying each up to [`BROADCAST_ATTEMPTS`]
    /// times. Returns the nodes that failed every attempt.
    pub async fn broadcast<F, Fut>(
        &self,
        excludes: &[ConnectionId],
        op: F,
    ) -> Vec<(SocketAddr, NodeError)>
    where
        F: Fn(Arc<NodeSession>) -> Fut,
        Fut: Future<Output = Result<(), SessionError>>,
    {
        let targets: Vec<_> = self
            .scan()
            .iter()
            .filter_map(|n| n.session().map(|s| (n.address(), s)))
            .filter(|(_, s)| !excludes.contains(&s.id()))
            .collect();
        let op = &op;
        let jobs = targets.into_iter().map(|(address, session)| async move {
            let mut last = None;
            for attempt in 1..=BROADCAST_ATTEMPTS {
                match op(Arc::clone(&session)).await {
                    Ok(()) => return None,
                    Err(e) => {
                        debug!(node = %address, attempt, error = %e, "broadcast attempt failed");
                        last = Some(e);
                    }
                }
            }
            last.map(|e| (address, NodeError::from(e)))
        });
        join_all(jobs).await.into_iter().flatten().collect()
    }

    pub async fn broadcast_mark(
        &self,
        excludes: &[ConnectionId],
        records: Vec<ClientRecord>,
    ) -> Vec<(SocketAddr, NodeError)> {
        let records = &records;
        self.broadcast(excludes, |s| async move { s.mark_clients(records.clone()).await })
            .await
    }

    pub async fn broadcast_unmark(
        &self,
        excludes: &[ConnectionId],
        ips: Vec<IpAddr>,
    ) -> Vec<(SocketAddr, NodeError)> {
        let ips = &ips;
        self.broadcast(excludes, |s| async move { s.unmark_clients(ips.clone()).await })
            .await
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<SocketAddr, Arc<Node>>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<SocketAddr, Arc<Node>>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sends `HEARTBEAT` every `period` until it fails, then closes the
/// session so the node gets detached.
async fn heartbeat_loop(session: Arc<NodeSession>, address: SocketAddr, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match session.heartbeat().await {
            Ok(delay) => trace!(node = %address, ?delay, "heartbeat"),
            Err(e) => {
                warn!(node = %address, error = %e, "heartbeat failed, disconnecting");
                session.close().await;
                return;
            }
        }
    }
}
