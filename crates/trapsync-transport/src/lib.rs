//! Transport abstraction layer for trapsync.
//!
//! Provides the [`Transport`] and [`Connection`] traits that the sync
//! protocol runs on. A connection is a reliable, ordered duplex byte
//! stream with a settable I/O deadline; framing is done one layer up.
//!
//! ```text
//! Protocol (frames) → Transport (bytes) → TCP / in-memory duplex
//! ```
//!
//! # Feature Flags
//!
//! - `tcp` (default): TCP listener and dialer via `tokio::net`

mod error;
mod stream;
#[cfg(feature = "tcp")]
mod tcp;

pub use error::TransportError;
pub use stream::{MemoryConnection, StreamConnection, memory_pair};
#[cfg(feature = "tcp")]
pub use tcp::{TcpConnection, TcpTransport, dial};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    /// Returns the address the transport is listening on.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// A single duplex byte stream.
///
/// All methods take `&self` so one task can read while another writes.
/// The returned futures are `Send`, which lets generic code spawn them.
pub trait Connection: Send + Sync + 'static {
    /// Writes all of `data` to the remote peer.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Reads at most `max` bytes.
    ///
    /// Returns `Ok(None)` when the stream reached end-of-file or the
    /// connection was closed locally.
    fn recv(
        &self,
        max: usize,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the connection. Idempotent.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// Address of the remote end.
    fn peer_addr(&self) -> SocketAddr;

    /// Address of the local end.
    fn local_addr(&self) -> SocketAddr;

    /// Sets the deadline applied to every subsequent read and write.
    /// `Duration::ZERO` disables it.
    fn set_timeout(&self, timeout: Duration);

    /// Returns the current I/O deadline.
    fn timeout(&self) -> Duration;

    /// Returns `true` once [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[test]
    fn test_connection_id_next_is_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.into_inner() > a.into_inner());
    }

    #[test]
    fn test_connection_id_hash_works_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(ConnectionId::new(1), "node-a");
        map.insert(ConnectionId::new(2), "node-b");
        assert_eq!(map[&ConnectionId::new(1)], "node-a");
    }
}
