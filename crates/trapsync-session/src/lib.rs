//! Sessions for trapsync.
//!
//! This crate turns a [`Messager`](trapsync_messager::Messager) into a
//! conversation with a mesh peer:
//!
//! 1. **Session**: the `HELLO` handshake, heartbeats and the outgoing
//!    half of the vocabulary ([`Session`])
//! 2. **Controllers**: answers to inbound requests for each end of the
//!    connection ([`controller::acceptor`], [`controller::dialer`])
//! 3. **Hooks**: what the controllers need from the rest of the process
//!    ([`AcceptorHooks`], [`DialerHooks`], [`Propagation`])
//! 4. **Registry**: accepted sessions and fan-out ([`SessionRegistry`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Node / Sync (above)   ← dial, accept, decide who to talk to
//!     ↕
//! Session (this crate)  ← authenticate and speak the trapsync vocabulary
//!     ↕
//! Messager (below)      ← correlate requests and replies
//! ```

pub mod controller;
mod error;
mod hooks;
mod registry;
mod session;

pub use error::SessionError;
pub use hooks::{AcceptorHooks, DialerHooks, Propagation};
pub use registry::{BROADCAST_ATTEMPTS, SessionRegistry};
pub use session::{Accepted, Role, Session, SessionConfig, SessionState};
