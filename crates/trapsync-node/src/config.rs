//! Node timing.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Timing shared by every node of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// How long each request waits for its reply.
    pub request_timeout: Duration,

    /// Dial and pre-authentication I/O deadline. Also the base of the
    /// reconnect backoff.
    pub connection_timeout: Duration,

    /// Largest message accepted from a node.
    pub max_receive_length: usize,
}

impl NodeConfig {
    /// Backoff never grows past this many connection timeouts.
    pub const MAX_RETRY_FACTOR: u32 = 32;

    /// Smallest accepted timeout.
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);

    /// Raises timeouts below [`Self::MIN_TIMEOUT`].
    pub fn validated(mut self) -> Self {
        if self.request_timeout < Self::MIN_TIMEOUT {
            warn!(
                timeout = ?self.request_timeout,
                min = ?Self::MIN_TIMEOUT,
                "request_timeout below minimum, clamping"
            );
            self.request_timeout = Self::MIN_TIMEOUT;
        }
        if self.connection_timeout < Self::MIN_TIMEOUT {
            warn!(
                timeout = ?self.connection_timeout,
                min = ?Self::MIN_TIMEOUT,
                "connection_timeout below minimum, clamping"
            );
            self.connection_timeout = Self::MIN_TIMEOUT;
        }
        self
    }

    /// Base retry period after a failed connection attempt.
    pub fn retry_period(&self) -> Duration {
        self.connection_timeout
    }

    /// Longest wait between two attempts.
    pub fn max_retry_period(&self) -> Duration {
        self.connection_timeout * Self::MAX_RETRY_FACTOR
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(6),
            connection_timeout: Duration::from_secs(120),
            max_receive_length: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_raises_zero_timeouts() {
        let config = NodeConfig {
            request_timeout: Duration::ZERO,
            connection_timeout: Duration::from_millis(1),
            ..NodeConfig::default()
        }
        .validated();

        assert_eq!(config.request_timeout, NodeConfig::MIN_TIMEOUT);
        assert_eq!(config.connection_timeout, NodeConfig::MIN_TIMEOUT);
    }

    #[test]
    fn test_max_retry_period_is_32_connection_timeouts() {
        let config = NodeConfig {
            connection_timeout: Duration::from_secs(2),
            ..NodeConfig::default()
        };

        assert_eq!(config.retry_period(), Duration::from_secs(2));
        assert_eq!(config.max_retry_period(), Duration::from_secs(64));
    }
}
