//! Outbound mesh nodes for trapsync.
//!
//! A node is a peer we dial ourselves. This crate keeps one [`Node`] per
//! configured address and a [`NodeRegistry`] that:
//!
//! - dials and authenticates nodes, with linear backoff on failure
//! - heartbeats every connected node
//! - tracks the partners each node announced, and skips nodes already
//!   reachable through a connected one ("mesh exclusion")
//! - fans client marks out to every connected node
//!
//! Changes seen through node connections are reported to a
//! [`MeshEvents`] implementor, which relays them to the accept side.

mod config;
mod error;
mod events;
mod node;
mod registry;

pub use config::NodeConfig;
pub use error::NodeError;
pub use events::{MeshEvents, NoEvents};
pub use node::{Node, NodeInfo, NodeSession};
pub use registry::NodeRegistry;
