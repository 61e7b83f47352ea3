//! Correlated request/reply messaging for trapsync.
//!
//! # Key types
//!
//! - [`SlotTable`]: 256 correlation slots with expiry
//! - [`Messager`]: request/reply engine over one connection
//! - [`Responders`] / [`Handler`]: inbound request dispatch by code
//! - [`MessagerConfig`]: receive and send length limits

mod config;
mod error;
mod messager;
mod responder;
mod slots;

pub use config::MessagerConfig;
pub use error::MessagerError;
pub use messager::{Messager, OUTBOX_CAPACITY, Reply, ReplyFlag, Stats};
pub use responder::{Handler, Request, Responders};
pub use slots::{DeleteReason, Occupant, SLOT_COUNT, SWEEP_INTERVAL, SlotTable};
