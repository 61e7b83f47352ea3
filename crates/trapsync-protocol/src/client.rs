//! Fixed-layout client mark record.
//!
//! ```text
//! [ client IP: 16 ][ server IP: 16 | server port: 2 LE ][ marked: 1 ][ type: rest ]
//! ```

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::peer::{ADDRESS_LEN, IP_LEN, decode_address, decode_ip, encode_address, encode_ip};
use crate::ProtocolError;

const MARKED: u8 = 0xFF;
const UNMARKED: u8 = 0x00;

/// Shortest valid encoding: both addresses plus the marked flag.
pub const CLIENT_RECORD_MIN_LEN: usize = IP_LEN + ADDRESS_LEN + 1;

/// A client observed by a trap listener, as propagated across the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Address of the offending client.
    pub client: IpAddr,
    /// The trap listener it touched.
    pub server: SocketAddr,
    /// Whether the client is currently marked.
    pub marked: bool,
    /// Listener kind, e.g. `"tcp"` or `"udp"`.
    pub kind: String,
}

impl ClientRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CLIENT_RECORD_MIN_LEN + self.kind.len());
        out.extend_from_slice(&encode_ip(self.client));
        out.extend_from_slice(&encode_address(self.server));
        out.push(if self.marked { MARKED } else { UNMARKED });
        out.extend_from_slice(self.kind.as_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < CLIENT_RECORD_MIN_LEN {
            return Err(ProtocolError::InvalidField(format!(
                "client record needs at least {CLIENT_RECORD_MIN_LEN} bytes, got {}",
                data.len()
            )));
        }

        let client = decode_ip(&data[..IP_LEN])?;
        let server = decode_address(&data[IP_LEN..IP_LEN + ADDRESS_LEN])?;
        let marked = data[CLIENT_RECORD_MIN_LEN - 1] != UNMARKED;
        let kind = String::from_utf8(data[CLIENT_RECORD_MIN_LEN..].to_vec())
            .map_err(|e| ProtocolError::InvalidField(format!("client type: {e}")))?;

        Ok(Self {
            client,
            server,
            marked,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ClientRecord {
        ClientRecord {
            client: "203.0.113.9".parse().unwrap(),
            server: "10.1.1.1:22".parse().unwrap(),
            marked: true,
            kind: "tcp".into(),
        }
    }

    #[test]
    fn test_to_bytes_layout_matches_fixed_offsets() {
        let bytes = record().to_bytes();

        assert_eq!(bytes.len(), CLIENT_RECORD_MIN_LEN + 3);
        assert_eq!(&bytes[12..16], &[203, 0, 113, 9]);
        assert_eq!(&bytes[28..32], &[10, 1, 1, 1]);
        assert_eq!(&bytes[32..34], &22u16.to_le_bytes());
        assert_eq!(bytes[34], 0xFF);
        assert_eq!(&bytes[35..], b"tcp");
    }

    #[test]
    fn test_from_bytes_restores_record() {
        let original = record();
        assert_eq!(ClientRecord::from_bytes(&original.to_bytes()).unwrap(), original);
    }

    #[test]
    fn test_from_bytes_unmarked_with_empty_type() {
        let mut r = record();
        r.marked = false;
        r.kind.clear();

        let decoded = ClientRecord::from_bytes(&r.to_bytes()).unwrap();

        assert!(!decoded.marked);
        assert!(decoded.kind.is_empty());
    }

    #[test]
    fn test_from_bytes_too_short_returns_error() {
        let err = ClientRecord::from_bytes(&[1u8; 34]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField(_)));
    }
}
