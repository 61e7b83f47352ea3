//! Messager limits.

use serde::{Deserialize, Serialize};
use tracing::warn;

use trapsync_protocol::CHUNK_SIZE;

/// Size limits applied by one messager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagerConfig {
    /// Largest inbound message accepted before it is discarded.
    pub max_receive_length: usize,

    /// Largest outbound message; longer ones fail without being written.
    /// Replaced by the peer's advertised limit after `HELLO`.
    pub max_send_length: usize,
}

impl MessagerConfig {
    /// Smallest limit either direction may be set to.
    pub const MIN_LENGTH: usize = CHUNK_SIZE;

    /// Clamps both limits to at least [`Self::MIN_LENGTH`].
    pub fn validated(mut self) -> Self {
        if self.max_receive_length < Self::MIN_LENGTH {
            warn!(
                length = self.max_receive_length,
                min = Self::MIN_LENGTH,
                "max_receive_length below minimum, clamping"
            );
            self.max_receive_length = Self::MIN_LENGTH;
        }
        self.max_send_length = clamp_length(self.max_send_length);
        self
    }
}

impl Default for MessagerConfig {
    fn default() -> Self {
        Self {
            max_receive_length: 4096,
            max_send_length: 4096,
        }
    }
}

pub(crate) fn clamp_length(length: usize) -> usize {
    length.max(MessagerConfig::MIN_LENGTH)
}
