//! Configuration for a trapsync instance.
//!
//! Loaded from JSON. Every field has a default, so a config file only
//! needs the values it changes:
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:7100",
//!   "passphrase": "correct horse",
//!   "nodes": [{ "address": "192.0.2.10:7100", "passphrase": "battery staple" }]
//! }
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use trapsync_node::NodeConfig;
use trapsync_protocol::CHUNK_SIZE;
use trapsync_session::SessionConfig;

use crate::TrapError;

/// A peer to dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: SocketAddr,
    /// Passphrase the peer expects in `HELLO`.
    #[serde(default)]
    pub passphrase: String,
}

/// Full configuration of a [`TrapSync`](crate::TrapSync).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Address the accept side binds to.
    pub listen: SocketAddr,
    /// Address peers reach us at, declared in `HELLO`. Defaults to the
    /// bound listen address unless that is a wildcard.
    pub advertise: Option<SocketAddr>,
    /// Passphrase dialers must present.
    pub passphrase: String,
    /// Peers to dial.
    pub nodes: Vec<NodeEntry>,
    /// Per-request reply timeout.
    pub request_timeout_ms: u64,
    /// Dial and pre-authentication I/O deadline; base reconnect backoff.
    pub connection_timeout_ms: u64,
    /// I/O deadline once authenticated. Never below the connection timeout.
    pub loose_timeout_ms: u64,
    /// Largest message accepted from any peer.
    pub max_receive_length: usize,
    /// How often unconnected nodes are retried.
    pub reconnect_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            advertise: None,
            passphrase: String::new(),
            nodes: Vec::new(),
            request_timeout_ms: 6_000,
            connection_timeout_ms: 120_000,
            loose_timeout_ms: 120_000,
            max_receive_length: 4096,
            reconnect_interval_ms: 10_000,
        }
    }
}

impl SyncConfig {
    /// Smallest accepted timeout or interval, in milliseconds.
    pub const MIN_TIMEOUT_MS: u64 = 100;

    /// Largest receive limit; the wire carries it as a `u16`.
    pub const MAX_RECEIVE_LENGTH: usize = u16::MAX as usize;

    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, TrapError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrapError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Clamps out-of-range values so the config is safe to use.
    ///
    /// Rules:
    /// - timeouts and the reconnect interval are at least
    ///   [`Self::MIN_TIMEOUT_MS`]
    /// - `loose_timeout_ms` is at least `connection_timeout_ms`
    /// - `max_receive_length` lies within `256..=65535`
    pub fn validated(mut self) -> Self {
        for (name, value) in [
            ("request_timeout_ms", &mut self.request_timeout_ms),
            ("connection_timeout_ms", &mut self.connection_timeout_ms),
            ("reconnect_interval_ms", &mut self.reconnect_interval_ms),
        ] {
            if *value < Self::MIN_TIMEOUT_MS {
                warn!(field = name, value = *value, min = Self::MIN_TIMEOUT_MS, "value below minimum, clamping");
                *value = Self::MIN_TIMEOUT_MS;
            }
        }
        if self.loose_timeout_ms < self.connection_timeout_ms {
            warn!(
                loose = self.loose_timeout_ms,
                connection = self.connection_timeout_ms,
                "loose_timeout_ms below connection_timeout_ms, raising"
            );
            self.loose_timeout_ms = self.connection_timeout_ms;
        }
        let clamped = self.max_receive_length.clamp(CHUNK_SIZE, Self::MAX_RECEIVE_LENGTH);
        if clamped != self.max_receive_length {
            warn!(
                length = self.max_receive_length,
                clamped,
                "max_receive_length out of range, clamping"
            );
            self.max_receive_length = clamped;
        }
        self
    }

    /// The address declared to peers once the accept side is bound to
    /// `bound`.
    pub fn advertised(&self, bound: SocketAddr) -> Option<SocketAddr> {
        self.advertise
            .or_else(|| (!bound.ip().is_unspecified()).then_some(bound))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn loose_timeout(&self) -> Duration {
        Duration::from_millis(self.loose_timeout_ms.max(self.connection_timeout_ms))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            request_timeout: self.request_timeout(),
            max_receive_length: self.max_receive_length,
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            request_timeout: self.request_timeout(),
            connection_timeout: self.connection_timeout(),
            max_receive_length: self.max_receive_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_str_fills_defaults() {
        let config = SyncConfig::from_json_str(
            r#"{
                "listen": "127.0.0.1:7100",
                "passphrase": "pw",
                "nodes": [{ "address": "192.0.2.10:7100" }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:7100".parse().unwrap());
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.nodes[0].passphrase, "");
        assert_eq!(config.request_timeout(), Duration::from_secs(6));
        assert_eq!(config.reconnect_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_advertised_skips_wildcard_listen() {
        let wildcard: SocketAddr = "0.0.0.0:7100".parse().unwrap();
        let loopback: SocketAddr = "127.0.0.1:7100".parse().unwrap();
        let public: SocketAddr = "192.0.2.1:7100".parse().unwrap();

        let config = SyncConfig::default();
        assert_eq!(config.advertised(wildcard), None);
        assert_eq!(config.advertised(loopback), Some(loopback));

        let config = SyncConfig {
            advertise: Some(public),
            ..SyncConfig::default()
        };
        assert_eq!(config.advertised(wildcard), Some(public));
    }

    #[test]
    fn test_from_json_str_rejects_bad_address() {
        let err = SyncConfig::from_json_str(r#"{ "listen": "nowhere" }"#).unwrap_err();

        assert!(matches!(err, TrapError::Config(_)));
    }

    #[test]
    fn test_validated_raises_loose_timeout_to_connection_timeout() {
        let config = SyncConfig {
            connection_timeout_ms: 5_000,
            loose_timeout_ms: 1_000,
            ..SyncConfig::default()
        }
        .validated();

        assert_eq!(config.loose_timeout_ms, 5_000);
    }

    #[test]
    fn test_validated_clamps_receive_length_and_timeouts() {
        let config = SyncConfig {
            max_receive_length: 1 << 20,
            request_timeout_ms: 0,
            reconnect_interval_ms: 1,
            ..SyncConfig::default()
        }
        .validated();

        assert_eq!(config.max_receive_length, 65535);
        assert_eq!(config.request_timeout_ms, SyncConfig::MIN_TIMEOUT_MS);
        assert_eq!(config.reconnect_interval_ms, SyncConfig::MIN_TIMEOUT_MS);
    }

    #[test]
    fn test_loose_timeout_never_below_connection_timeout() {
        let config = SyncConfig {
            connection_timeout_ms: 3_000,
            loose_timeout_ms: 10,
            ..SyncConfig::default()
        };

        assert_eq!(config.loose_timeout(), Duration::from_secs(3));
    }
}
