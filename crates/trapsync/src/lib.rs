//! # trapsync
//!
//! Shares trap detections between hosts.
//!
//! Each host runs one [`TrapSync`]. It listens for peers that dial in and
//! dials the peers listed in its config. Once a passphrase handshake
//! succeeds, clients marked on any host are pushed to every other host in
//! the mesh and imported into its [`ClientSink`].
//!
//! The layers, bottom up:
//!
//! | Crate | Provides |
//! |-------|----------|
//! | `trapsync-transport` | TCP and in-memory byte streams |
//! | `trapsync-protocol` | framing, escaping, payloads |
//! | `trapsync-messager` | request/reply correlation over one stream |
//! | `trapsync-session` | handshake, heartbeat, partner and client ops |
//! | `trapsync-node` | dialed peers, backoff, mesh exclusion |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trapsync::prelude::*;
//!
//! # async fn run() -> Result<(), TrapError> {
//! let sink = Arc::new(MemorySink::new());
//! let sync = TrapSync::new(SyncConfig::from_path("trapsync.json")?, sink)?;
//! sync.serve().await?;
//! // ... later
//! sync.down().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
pub mod logging;
mod server;
mod sink;
mod status;
mod sync;

pub use config::{NodeEntry, SyncConfig};
pub use error::TrapError;
pub use server::{ServerSessions, SyncServer};
pub use sink::{ClientSink, MemorySink};
pub use status::{ClientInfo, ServerInfo, Status};
pub use sync::TrapSync;

pub use trapsync_messager as messager;
pub use trapsync_node as node;
pub use trapsync_protocol as protocol;
pub use trapsync_session as session;
pub use trapsync_transport as transport;

/// Convenience re-exports for the common case.
pub mod prelude {
    pub use crate::{ClientSink, MemorySink, Status, SyncConfig, TrapError, TrapSync};
    pub use trapsync_protocol::ClientRecord;
}
