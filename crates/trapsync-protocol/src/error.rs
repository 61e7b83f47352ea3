//! Error types for the protocol layer.
//!
//! Each crate in trapsync defines its own error enum. A `ProtocolError`
//! means the bytes did not form a valid message, or the stream under the
//! parser went away.

use trapsync_transport::TransportError;

use crate::{Code, MessageId};

/// Errors that can occur while framing, parsing or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The stream ended before a complete frame arrived.
    #[error("end of stream reached")]
    EofReached,

    /// The connection failed underneath the parser.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame grew past the receive limit. The rest of it is skipped.
    ///
    /// `id` and `code` are set when the header was complete before the
    /// limit tripped.
    #[error("frame exceeds {limit} bytes")]
    FrameTooLong {
        id: Option<MessageId>,
        code: Option<Code>,
        limit: usize,
    },

    /// The id or code field is missing or not exactly one byte.
    #[error("invalid frame header: {0}")]
    InvalidHeader(String),

    /// The code byte does not name any known operation.
    #[error("unknown operation code {0}")]
    UnknownCode(u8),

    /// The payload carries fewer fields than the operation needs.
    #[error("expected {expected} field(s), got {got}")]
    MissingFields { expected: usize, got: usize },

    /// A field has the wrong size or content.
    #[error("invalid field: {0}")]
    InvalidField(String),
}
