//! Where propagated clients end up.
//!
//! Marks arriving from the mesh are handed to a [`ClientSink`]: usually
//! the trap's own client table, so a client caught on one host is treated
//! as caught everywhere.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use trapsync_protocol::ClientRecord;

use crate::TrapError;

/// Local consumer of client marks received from peers.
///
/// Both methods are called from connection read tasks and must not block.
pub trait ClientSink: Send + Sync + 'static {
    /// Stores or refreshes a marked client.
    ///
    /// An error makes the mark fail for the peer that sent it, and the
    /// mark is not relayed further.
    fn import_client(&self, record: &ClientRecord) -> Result<(), TrapError>;

    /// Forgets a client.
    fn remove_client(&self, ip: IpAddr);
}

/// A [`ClientSink`] that keeps clients in a map, keyed by client IP.
#[derive(Debug, Default)]
pub struct MemorySink {
    clients: Mutex<HashMap<IpAddr, ClientRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ip: IpAddr) -> Option<ClientRecord> {
        self.lock().get(&ip).cloned()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.lock().contains_key(&ip)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All stored clients, in no particular order.
    pub fn clients(&self) -> Vec<ClientRecord> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, ClientRecord>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ClientSink for MemorySink {
    fn import_client(&self, record: &ClientRecord) -> Result<(), TrapError> {
        self.lock().insert(record.client, record.clone());
        Ok(())
    }

    fn remove_client(&self, ip: IpAddr) {
        self.lock().remove(&ip);
    }
}
