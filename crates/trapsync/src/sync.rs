//! The orchestrator: one accept side, a set of dialed nodes, and the
//! glue that moves client marks between them.
//!
//! # Propagation
//!
//! A mark reaches us either from a local detection ([`TrapSync::mark`])
//! or from a peer. Peer marks are imported into the [`ClientSink`] and
//! then relayed to every other connection, never back to the one they
//! came from. Mesh exclusion keeps the graph a tree, so a relayed mark
//! cannot come around again: in a configured ring the last edge is refused
//! with `HELLO_CONFLICT`.
//!
//! ```text
//!   A ──dial──▶ B ──dial──▶ C ──dial──╳ A   (C already reached by A)
//!   mark(x) at A:  A → B (import, relay) → C (import)
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use trapsync_node::{MeshEvents, NodeRegistry};
use trapsync_protocol::{ClientRecord, PeerSet};
use trapsync_session::{AcceptorHooks, Propagation, SessionError};
use trapsync_transport::ConnectionId;

use crate::server::{ServerSessions, SyncServer};
use crate::status::{ClientInfo, ServerInfo, Status};
use crate::{ClientSink, SyncConfig, TrapError};

// ===========================================================================
// Mesh glue
// ===========================================================================

/// Answers both the accept side's hooks and the node registry's events.
struct Mesh {
    passphrase: String,
    loose_timeout: Duration,
    sink: Arc<dyn ClientSink>,
    nodes: OnceLock<Weak<NodeRegistry>>,
    sessions: Arc<ServerSessions>,
}

impl Mesh {
    fn nodes(&self) -> Option<Arc<NodeRegistry>> {
        self.nodes.get().and_then(Weak::upgrade)
    }

    fn import(&self, origin: ConnectionId, records: Vec<ClientRecord>) -> Result<(), SessionError> {
        for record in &records {
            self.sink.import_client(record).map_err(|e| {
                warn!(conn = %origin, client = %record.client, error = %e, "client import failed");
                SessionError::Rejected(e.to_string())
            })?;
        }
        debug!(conn = %origin, clients = records.len(), "clients imported");

        let nodes = self.nodes();
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            relay_mark(nodes, sessions, &[origin], records).await;
        });
        Ok(())
    }

    fn remove(&self, origin: ConnectionId, ips: Vec<IpAddr>) -> Result<(), SessionError> {
        for ip in &ips {
            self.sink.remove_client(*ip);
        }
        debug!(conn = %origin, clients = ips.len(), "clients removed");

        let nodes = self.nodes();
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            relay_unmark(nodes, sessions, &[origin], ips).await;
        });
        Ok(())
    }
}

impl Propagation for Mesh {
    fn partners(&self) -> PeerSet {
        self.nodes().map(|n| n.partners()).unwrap_or_default()
    }

    fn mark_clients(
        &self,
        origin: ConnectionId,
        records: Vec<ClientRecord>,
    ) -> Result<(), SessionError> {
        self.import(origin, records)
    }

    fn unmark_clients(&self, origin: ConnectionId, ips: Vec<IpAddr>) -> Result<(), SessionError> {
        self.remove(origin, ips)
    }
}

impl AcceptorHooks for Mesh {
    fn passphrase(&self) -> String {
        self.passphrase.clone()
    }

    fn loose_timeout(&self) -> Duration {
        self.loose_timeout
    }

    fn on_authed(&self, id: ConnectionId, peer: SocketAddr) {
        info!(conn = %id, %peer, "peer authenticated");
    }

    fn on_auth_failed(&self, peer: SocketAddr) {
        warn!(%peer, "peer failed authentication");
    }
}

impl MeshEvents for Mesh {
    fn partners_added(&self, origin: ConnectionId, partners: PeerSet) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            for (id, e) in sessions.broadcast_partners_added(&[origin], partners).await {
                debug!(conn = %id, error = %e, "partner add not delivered");
            }
        });
    }

    fn partners_removed(&self, origin: ConnectionId, partners: PeerSet) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            for (id, e) in sessions.broadcast_partners_removed(&[origin], partners).await {
                debug!(conn = %id, error = %e, "partner remove not delivered");
            }
        });
    }

    fn clients_marked(
        &self,
        origin: ConnectionId,
        records: Vec<ClientRecord>,
    ) -> Result<(), SessionError> {
        self.import(origin, records)
    }

    fn clients_unmarked(&self, origin: ConnectionId, ips: Vec<IpAddr>) -> Result<(), SessionError> {
        self.remove(origin, ips)
    }
}

/// Sends marks to every node and accepted session not in `excludes`.
/// Returns how many peers failed every attempt.
async fn relay_mark(
    nodes: Option<Arc<NodeRegistry>>,
    sessions: Arc<ServerSessions>,
    excludes: &[ConnectionId],
    records: Vec<ClientRecord>,
) -> usize {
    let mut failed = 0;
    if let Some(nodes) = nodes {
        for (addr, e) in nodes.broadcast_mark(excludes, records.clone()).await {
            warn!(node = %addr, error = %e, "mark not delivered");
            failed += 1;
        }
    }
    for (id, e) in sessions.broadcast_mark(excludes, records).await {
        warn!(conn = %id, error = %e, "mark not delivered");
        failed += 1;
    }
    failed
}

async fn relay_unmark(
    nodes: Option<Arc<NodeRegistry>>,
    sessions: Arc<ServerSessions>,
    excludes: &[ConnectionId],
    ips: Vec<IpAddr>,
) -> usize {
    let mut failed = 0;
    if let Some(nodes) = nodes {
        for (addr, e) in nodes.broadcast_unmark(excludes, ips.clone()).await {
            warn!(node = %addr, error = %e, "unmark not delivered");
            failed += 1;
        }
    }
    for (id, e) in sessions.broadcast_unmark(excludes, ips).await {
        warn!(conn = %id, error = %e, "unmark not delivered");
        failed += 1;
    }
    failed
}

// ===========================================================================
// TrapSync
// ===========================================================================

/// A trapsync instance.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use trapsync::prelude::*;
///
/// # async fn run() -> Result<(), TrapError> {
/// let config = SyncConfig::from_path("trapsync.json")?;
/// let sync = TrapSync::new(config, Arc::new(MemorySink::new()))?;
/// let addr = sync.serve().await?;
/// println!("listening on {addr}");
/// sync.down().await;
/// # Ok(())
/// # }
/// ```
pub struct TrapSync {
    config: SyncConfig,
    mesh: Arc<Mesh>,
    nodes: Arc<NodeRegistry>,
    sessions: Arc<ServerSessions>,
    server: Mutex<Option<SyncServer>>,
    cron: Mutex<Option<JoinHandle<()>>>,
}

impl TrapSync {
    /// Builds an instance and registers the configured nodes. Nothing
    /// listens or dials until [`serve`](Self::serve).
    ///
    /// # Errors
    /// [`TrapError::Node`] if the config lists the same address twice.
    pub fn new(config: SyncConfig, sink: Arc<dyn ClientSink>) -> Result<Self, TrapError> {
        let config = config.validated();
        let sessions = Arc::new(ServerSessions::new());
        let mesh = Arc::new(Mesh {
            passphrase: config.passphrase.clone(),
            loose_timeout: config.loose_timeout(),
            sink,
            nodes: OnceLock::new(),
            sessions: Arc::clone(&sessions),
        });
        let events: Arc<dyn MeshEvents> = mesh.clone();
        let nodes = NodeRegistry::new(config.node_config(), events);
        let _ = mesh.nodes.set(Arc::downgrade(&nodes));

        for entry in &config.nodes {
            nodes.register(entry.address, entry.passphrase.clone())?;
        }

        Ok(Self {
            config,
            mesh,
            nodes,
            sessions,
            server: Mutex::new(None),
            cron: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn sessions(&self) -> &Arc<ServerSessions> {
        &self.sessions
    }

    /// Binds the accept side, dials every reconnectable node, and starts
    /// the reconnect cron. Returns the bound address.
    ///
    /// # Errors
    /// - [`TrapError::AlreadyServing`] if already serving
    /// - [`TrapError::Transport`] if the listen address cannot be bound
    pub async fn serve(&self) -> Result<SocketAddr, TrapError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(TrapError::AlreadyServing);
        }
        let bound = SyncServer::bind(
            self.config.listen,
            self.config.connection_timeout(),
            self.config.session_config(),
            Arc::clone(&self.sessions),
            Arc::clone(&self.mesh),
        )
        .await?;
        let addr = bound.local_addr();
        *server = Some(bound);
        drop(server);

        let advertised = self.config.advertised(addr);
        if advertised.is_none() {
            warn!(
                listen = %addr,
                "wildcard listen without an advertise address, ring detection is off"
            );
        }
        self.nodes.set_local_address(advertised);

        let connected = self.nodes.connect_all().await;
        info!(listen = %addr, nodes = self.nodes.len(), connected, "trapsync serving");

        let cron = tokio::spawn(reconnect_cron(
            Arc::downgrade(&self.nodes),
            self.config.reconnect_interval(),
        ));
        if let Some(old) = self.cron.lock().await.replace(cron) {
            old.abort();
        }
        Ok(addr)
    }

    /// Address the accept side is bound to, while serving.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(SyncServer::local_addr)
    }

    /// Registers a node. The reconnect cron dials it on its next tick;
    /// call [`connect`](Self::connect) to dial right away.
    pub fn add_node(&self, address: SocketAddr, passphrase: impl Into<String>) -> Result<(), TrapError> {
        self.nodes.register(address, passphrase)?;
        Ok(())
    }

    /// Disconnects and forgets a node.
    pub async fn remove_node(&self, address: SocketAddr) -> Result<(), TrapError> {
        self.nodes.remove(address).await?;
        Ok(())
    }

    /// Dials one registered node now.
    pub async fn connect(&self, address: SocketAddr) -> Result<(), TrapError> {
        self.nodes.connect(address).await?;
        Ok(())
    }

    /// Shares locally detected clients with every connected node and every
    /// authenticated accepted peer. Returns how many peers could not be
    /// reached.
    pub async fn mark(&self, records: Vec<ClientRecord>) -> usize {
        debug!(clients = records.len(), "marking local clients");
        relay_mark(Some(Arc::clone(&self.nodes)), Arc::clone(&self.sessions), &[], records).await
    }

    /// Withdraws clients across the mesh. Returns how many peers could not
    /// be reached.
    pub async fn unmark(&self, ips: Vec<IpAddr>) -> usize {
        debug!(clients = ips.len(), "unmarking local clients");
        relay_unmark(Some(Arc::clone(&self.nodes)), Arc::clone(&self.sessions), &[], ips).await
    }

    pub async fn status(&self) -> Status {
        let listen = self.local_addr().await;
        let clients = self
            .sessions
            .all()
            .iter()
            .map(|s| ClientInfo {
                remote: s.peer_addr(),
                authed: s.is_authed(),
                delay: s.delay(),
                stats: s.stats(),
            })
            .collect();
        Status {
            nodes: self.nodes.infos(),
            server: ServerInfo { listen, clients },
        }
    }

    /// Stops the reconnect cron, says `BYE` to every node, and shuts the
    /// accept side down. Registered nodes are kept; `serve` may be called
    /// again.
    pub async fn down(&self) {
        if let Some(cron) = self.cron.lock().await.take() {
            cron.abort();
        }
        self.nodes.disconnect_all().await;
        self.nodes.set_local_address(None);
        if let Some(server) = self.server.lock().await.take() {
            server.shutdown().await;
        }
        info!("trapsync down");
    }
}

/// Retries unconnected nodes every `interval`, starting after a random
/// delay of up to one interval so restarted peers do not dial in step.
async fn reconnect_cron(nodes: Weak<NodeRegistry>, interval: Duration) {
    let jitter = rand::rng().random_range(0..=interval.as_millis() as u64);
    let start = Instant::now() + Duration::from_millis(jitter);
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(nodes) = nodes.upgrade() else {
            return;
        };
        let connected = nodes.connect_all().await;
        if connected > 0 {
            info!(connected, "reconnected nodes");
        }
    }
}
