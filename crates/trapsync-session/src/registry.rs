//! Registry of accepted sessions.
//!
//! The accept side keeps every live session here, keyed by connection id,
//! so that partner changes and client marks can be fanned out to all
//! authenticated peers at once.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::future::join_all;
use tracing::{debug, info};

use trapsync_protocol::{ClientRecord, PeerSet};
use trapsync_transport::{Connection, ConnectionId};

use crate::{Session, SessionError};

/// How many times [`SessionRegistry::broadcast`] tries each session.
pub const BROADCAST_ATTEMPTS: usize = 3;

/// Live sessions by connection id.
pub struct SessionRegistry<C: Connection> {
    sessions: RwLock<HashMap<ConnectionId, Arc<Session<C>>>>,
}

impl<C: Connection> SessionRegistry<C> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Adds `session`.
    ///
    /// # Errors
    /// [`SessionError::SessionAlreadyRegistered`] if its id is taken.
    pub fn register(&self, session: Arc<Session<C>>) -> Result<(), SessionError> {
        let id = session.id();
        let mut sessions = self.write();
        if sessions.contains_key(&id) {
            return Err(SessionError::SessionAlreadyRegistered(id));
        }
        sessions.insert(id, session);
        debug!(conn = %id, total = sessions.len(), "session registered");
        Ok(())
    }

    /// Removes and returns the session registered under `id`.
    ///
    /// # Errors
    /// [`SessionError::SessionNotRegistered`] if there is none.
    pub fn unregister(&self, id: ConnectionId) -> Result<Arc<Session<C>>, SessionError> {
        let mut sessions = self.write();
        let session = sessions
            .remove(&id)
            .ok_or(SessionError::SessionNotRegistered(id))?;
        debug!(conn = %id, total = sessions.len(), "session unregistered");
        Ok(session)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Session<C>>> {
        self.read().get(&id).cloned()
    }

    /// Authenticated sessions, skipping `excludes`.
    pub fn scan(&self, excludes: &[ConnectionId]) -> Vec<Arc<Session<C>>> {
        self.read()
            .values()
            .filter(|s| !excludes.contains(&s.id()) && s.is_authed())
            .cloned()
            .collect()
    }

    /// Every registered session, authenticated or not.
    pub fn all(&self) -> Vec<Arc<Session<C>>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Runs `op` against every session [`scan`](Self::scan) yields, all at
    /// once, trying each up to [`BROADCAST_ATTEMPTS`] times.
    ///
    /// Returns the sessions that failed every attempt, with their last
    /// error.
    pub async fn broadcast<F, Fut>(
        &self,
        excludes: &[ConnectionId],
        op: F,
    ) -> Vec<(ConnectionId, SessionError)>
    where
        F: Fn(Arc<Session<C>>) -> Fut,
        Fut: Future<Output = Result<(), SessionError>>,
    {
        let targets = self.scan(excludes);
        let op = &op;
        let jobs = targets.into_iter().map(|session| async move {
            let id = session.id();
            let mut last = None;
            for attempt in 1..=BROADCAST_ATTEMPTS {
                match op(Arc::clone(&session)).await {
                    Ok(()) => return None,
                    Err(e) => {
                        debug!(conn = %id, attempt, error = %e, "broadcast attempt failed");
                        last = Some(e);
                    }
                }
            }
            last.map(|e| (id, e))
        });
        join_all(jobs).await.into_iter().flatten().collect()
    }

    pub async fn broadcast_partners_added(
        &self,
        excludes: &[ConnectionId],
        partners: PeerSet,
    ) -> Vec<(ConnectionId, SessionError)> {
        let partners = &partners;
        self.broadcast(excludes, |s| async move { s.add_partners(partners.clone()).await })
            .await
    }

    pub async fn broadcast_partners_removed(
        &self,
        excludes: &[ConnectionId],
        partners: PeerSet,
    ) -> Vec<(ConnectionId, SessionError)> {
        let partners = &partners;
        self.broadcast(excludes, |s| async move {
            s.remove_partners(partners.clone()).await
        })
        .await
    }

    pub async fn broadcast_mark(
        &self,
        excludes: &[ConnectionId],
        records: Vec<ClientRecord>,
    ) -> Vec<(ConnectionId, SessionError)> {
        let records = &records;
        self.broadcast(excludes, |s| async move { s.mark_clients(records.clone()).await })
            .await
    }

    pub async fn broadcast_unmark(
        &self,
        excludes: &[ConnectionId],
        ips: Vec<IpAddr>,
    ) -> Vec<(ConnectionId, SessionError)> {
        let ips = &ips;
        self.broadcast(excludes, |s| async move { s.unmark_clients(ips.clone()).await })
            .await
    }

    /// Says `BYE` to and forgets every session.
    pub async fn clear(&self) {
        let drained: Vec<_> = self.write().drain().map(|(_, s)| s).collect();
        if drained.is_empty() {
            return;
        }
        info!(sessions = drained.len(), "closing all sessions");
        join_all(drained.iter().map(|s| async move {
            if let Err(e) = s.bye().await {
                debug!(conn = %s.id(), error = %e, "bye failed");
            }
        }))
        .await;
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<Session<C>>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<Session<C>>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C: Connection> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Role, SessionConfig};
    use trapsync_transport::{MemoryConnection, memory_pair};

    fn session() -> Arc<Session<MemoryConnection>> {
        let (a, _b) = memory_pair(
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
        );
        Session::new(a, Role::Acceptor, SessionConfig::default())
    }

    #[tokio::test]
    async fn test_register_duplicate_fails() {
        let registry = SessionRegistry::new();
        let s = session();
        registry.register(Arc::clone(&s)).unwrap();

        let err = registry.register(s).unwrap_err();

        assert!(matches!(err, SessionError::SessionAlreadyRegistered(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_unknown_fails() {
        let registry: SessionRegistry<MemoryConnection> = SessionRegistry::new();

        let Err(err) = registry.unregister(ConnectionId::new(999_999)) else {
            panic!("unregistering an unknown id must fail");
        };

        assert!(matches!(err, SessionError::SessionNotRegistered(_)));
    }

    #[tokio::test]
    async fn test_scan_skips_unauthenticated_and_excluded() {
        let registry = SessionRegistry::new();
        let (pending, authed, excluded) = (session(), session(), session());
        authed.set_authed();
        excluded.set_authed();
        for s in [&pending, &authed, &excluded] {
            registry.register(Arc::clone(s)).unwrap();
        }

        let found = registry.scan(&[excluded.id()]);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), authed.id());
        assert_eq!(registry.all().len(), 3);
    }

    #[tokio::test]
    async fn test_broadcast_retries_failures_three_times() {
        let registry = SessionRegistry::new();
        let s = session();
        s.set_authed();
        registry.register(Arc::clone(&s)).unwrap();
        let calls = std::sync::atomic::AtomicUsize::new(0);

        let failed = registry
            .broadcast(&[], |_| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(SessionError::Rejected("nope".into())) }
            })
            .await;

        assert_eq!(calls.into_inner(), BROADCAST_ATTEMPTS);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, s.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_empties_and_closes_sessions() {
        let registry = SessionRegistry::new();
        let s = session();
        registry.register(Arc::clone(&s)).unwrap();

        registry.clear().await;

        assert!(registry.is_empty());
        assert!(s.connection().is_closed());
    }
}
