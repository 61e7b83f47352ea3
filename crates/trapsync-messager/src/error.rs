//! Error types for the messager layer.

use trapsync_protocol::{Code, MessageId, ProtocolError};
use trapsync_transport::TransportError;

/// Errors that can occur while correlating requests and replies.
#[derive(Debug, thiserror::Error)]
pub enum MessagerError {
    /// The slot table has been torn down; no new requests are accepted.
    #[error("message slots are disabled")]
    SlotsDisabled,

    /// Nothing is held under this id.
    #[error("no message held in slot {0}")]
    SlotNotFound(MessageId),

    /// No reply arrived before the request's deadline.
    #[error("message expired before a reply arrived")]
    MessageExpired,

    /// The session was torn down while the request was in flight.
    #[error("message cleared")]
    MessageCleared,

    /// The request was discarded before it could be written.
    #[error("message dropped")]
    MessageDropped,

    /// The encoded message is longer than the allowed limit.
    #[error("message of {len} bytes exceeds limit of {limit}")]
    MessageTooLong { len: usize, limit: usize },

    /// The writer has stopped; nothing more can be sent.
    #[error("messager is no longer writable")]
    MessageUnwritable,

    /// A reply arrived for a request that has not been written yet.
    #[error("reply arrived before the request was sent")]
    MessageRespondNotReady,

    /// A held request got a reply code it did not ask for.
    #[error("unexpected response {0}")]
    UnexpectedResponse(Code),

    /// `listen` was called on a messager that is already running.
    #[error("messager is already listening")]
    AlreadyListening,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
