//! Typed field layouts for each operation.
//!
//! A payload turns itself into a list of byte fields with
//! [`Payload::build`] and is recovered with [`Payload::parse`]. Both
//! directions are fallible. Parsing checks the minimum field count first
//! and then decodes each field by position; extra trailing fields are
//! ignored so newer peers can append data.

use std::net::IpAddr;
use std::time::Duration;

use crate::client::ClientRecord;
use crate::peer::{IP_LEN, PeerSet, decode_ip, encode_ip};
use crate::ProtocolError;

/// Width of an encoded varint integer field.
const VARINT_LEN: usize = 10;

/// Conversion between a typed message body and its wire fields.
pub trait Payload: Sized {
    fn build(&self) -> Result<Vec<Vec<u8>>, ProtocolError>;
    fn parse(fields: &[Vec<u8>]) -> Result<Self, ProtocolError>;
}

/// Fails with [`ProtocolError::MissingFields`] unless `fields` has at
/// least `min` entries.
pub fn verify(fields: &[Vec<u8>], min: usize) -> Result<(), ProtocolError> {
    if fields.len() < min {
        return Err(ProtocolError::MissingFields {
            expected: min,
            got: fields.len(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scalar encoders
// ---------------------------------------------------------------------------

pub fn encode_u16(value: u16) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_u16(data: &[u8]) -> Result<u16, ProtocolError> {
    let bytes: [u8; 2] = data.try_into().map_err(|_| {
        ProtocolError::InvalidField(format!("u16 must be 2 bytes, got {}", data.len()))
    })?;
    Ok(u16::from_le_bytes(bytes))
}

/// Zig-zag varint in a zero-filled 10-byte field.
pub fn encode_i64(value: i64) -> Vec<u8> {
    let mut ux = (value as u64) << 1;
    if value < 0 {
        ux = !ux;
    }

    let mut out = vec![0u8; VARINT_LEN];
    let mut i = 0;
    while ux >= 0x80 {
        out[i] = (ux as u8) | 0x80;
        ux >>= 7;
        i += 1;
    }
    out[i] = ux as u8;
    out
}

pub fn decode_i64(data: &[u8]) -> Result<i64, ProtocolError> {
    if data.len() != VARINT_LEN {
        return Err(ProtocolError::InvalidField(format!(
            "varint must be {VARINT_LEN} bytes, got {}",
            data.len()
        )));
    }

    let mut ux: u64 = 0;
    let mut shift = 0u32;
    let mut terminated = false;
    for (i, &b) in data.iter().enumerate() {
        if b < 0x80 {
            if i == VARINT_LEN - 1 && b > 1 {
                return Err(ProtocolError::InvalidField("varint overflows i64".into()));
            }
            ux |= u64::from(b) << shift;
            terminated = true;
            break;
        }
        ux |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    if !terminated {
        return Err(ProtocolError::InvalidField("unterminated varint".into()));
    }

    let mut x = (ux >> 1) as i64;
    if ux & 1 != 0 {
        x = !x;
    }
    Ok(x)
}

/// Durations travel as signed nanoseconds; anything past `i64::MAX`
/// saturates.
pub fn encode_duration(value: Duration) -> Vec<u8> {
    let nanos = i64::try_from(value.as_nanos()).unwrap_or(i64::MAX);
    encode_i64(nanos)
}

pub fn decode_duration(data: &[u8]) -> Result<Duration, ProtocolError> {
    let nanos = decode_i64(data)?;
    let nanos = u64::try_from(nanos)
        .map_err(|_| ProtocolError::InvalidField(format!("negative duration {nanos}ns")))?;
    Ok(Duration::from_nanos(nanos))
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// No fields. Used by heartbeats, `BYE` and every accept/deny reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Empty;

impl Payload for Empty {
    fn build(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        Ok(Vec::new())
    }

    fn parse(_fields: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        Ok(Empty)
    }
}

/// `HELLO`: `[max_length u16][passphrase][partners]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Largest message the dialer is willing to receive.
    pub max_length: u16,
    pub passphrase: String,
    /// Addresses the dialer is already connected with.
    pub partners: PeerSet,
}

impl Payload for Hello {
    fn build(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        Ok(vec![
            encode_u16(self.max_length),
            self.passphrase.as_bytes().to_vec(),
            self.partners.to_bytes(),
        ])
    }

    fn parse(fields: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        verify(fields, 3)?;
        Ok(Self {
            max_length: decode_u16(&fields[0])?,
            passphrase: String::from_utf8(fields[1].clone())
                .map_err(|e| ProtocolError::InvalidField(format!("passphrase: {e}")))?,
            partners: PeerSet::from_bytes(&fields[2])?,
        })
    }
}

/// `HELLO_ACCEPT`: `[max_length u16][heartbeat_period][timeout][partners]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloAccept {
    /// Largest message the acceptor is willing to receive.
    pub max_length: u16,
    /// How often the dialer should send `HEARTBEAT`.
    pub heartbeat_period: Duration,
    /// Idle deadline the acceptor applies to the connection.
    pub timeout: Duration,
    /// Addresses the acceptor is already connected with.
    pub partners: PeerSet,
}

impl Payload for HelloAccept {
    fn build(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        Ok(vec![
            encode_u16(self.max_length),
            encode_duration(self.heartbeat_period),
            encode_duration(self.timeout),
            self.partners.to_bytes(),
        ])
    }

    fn parse(fields: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        verify(fields, 4)?;
        Ok(Self {
            max_length: decode_u16(&fields[0])?,
            heartbeat_period: decode_duration(&fields[1])?,
            timeout: decode_duration(&fields[2])?,
            partners: PeerSet::from_bytes(&fields[3])?,
        })
    }
}

/// `HELLO_CONFLICT`: the partners both sides already share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloConflict {
    pub partners: PeerSet,
}

impl Payload for HelloConflict {
    fn build(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        Ok(vec![self.partners.to_bytes()])
    }

    fn parse(fields: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        verify(fields, 1)?;
        Ok(Self {
            partners: PeerSet::from_bytes(&fields[0])?,
        })
    }
}

/// `PARTNER_ADD` / `PARTNER_REMOVE`: `[removed][added]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartnerChange {
    pub removed: PeerSet,
    pub added: PeerSet,
}

impl PartnerChange {
    pub fn added(added: PeerSet) -> Self {
        Self {
            removed: PeerSet::new(),
            added,
        }
    }

    pub fn removed(removed: PeerSet) -> Self {
        Self {
            removed,
            added: PeerSet::new(),
        }
    }
}

impl Payload for PartnerChange {
    fn build(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        Ok(vec![self.removed.to_bytes(), self.added.to_bytes()])
    }

    fn parse(fields: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        verify(fields, 2)?;
        Ok(Self {
            removed: PeerSet::from_bytes(&fields[0])?,
            added: PeerSet::from_bytes(&fields[1])?,
        })
    }
}

/// `CLIENT_MARK`: one client record per field, at least one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMark {
    pub records: Vec<ClientRecord>,
}

impl Payload for ClientMark {
    fn build(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if self.records.is_empty() {
            return Err(ProtocolError::MissingFields {
                expected: 1,
                got: 0,
            });
        }
        Ok(self.records.iter().map(ClientRecord::to_bytes).collect())
    }

    fn parse(fields: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        verify(fields, 1)?;
        let records = fields
            .iter()
            .map(|f| ClientRecord::from_bytes(f))
            .collect::<Result<_, _>>()?;
        Ok(Self { records })
    }
}

/// `CLIENT_UNMARK`: one 16-byte IP per field, at least one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUnmark {
    pub ips: Vec<IpAddr>,
}

impl Payload for ClientUnmark {
    fn build(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if self.ips.is_empty() {
            return Err(ProtocolError::MissingFields {
                expected: 1,
                got: 0,
            });
        }
        Ok(self.ips.iter().map(|ip| encode_ip(*ip).to_vec()).collect())
    }

    fn parse(fields: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        verify(fields, 1)?;
        let ips = fields
            .iter()
            .map(|f| {
                if f.len() != IP_LEN {
                    return Err(ProtocolError::InvalidField(format!(
                        "IP must be {IP_LEN} bytes, got {}",
                        f.len()
                    )));
                }
                decode_ip(f)
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { ips })
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(addrs: &[&str]) -> PeerSet {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_encode_i64_matches_zigzag_varint() {
        assert_eq!(encode_i64(0), vec![0; 10]);
        assert_eq!(&encode_i64(-1)[..2], &[1, 0]);
        assert_eq!(&encode_i64(1)[..2], &[2, 0]);
        assert_eq!(&encode_i64(64)[..3], &[0x80, 0x01, 0]);
    }

    #[test]
    fn test_decode_i64_handles_extremes() {
        for v in [i64::MIN, -1, 0, 1, 300, i64::MAX] {
            assert_eq!(decode_i64(&encode_i64(v)).unwrap(), v);
        }
    }

    #[test]
    fn test_decode_i64_wrong_width_returns_error() {
        assert!(matches!(decode_i64(&[0; 8]), Err(ProtocolError::InvalidField(_))));
        assert!(matches!(decode_i64(&[0x80; 10]), Err(ProtocolError::InvalidField(_))));
    }

    #[test]
    fn test_decode_duration_rejects_negative() {
        let err = decode_duration(&encode_i64(-5)).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField(_)));
    }

    #[test]
    fn test_hello_parse_restores_fields() {
        let hello = Hello {
            max_length: 4096,
            passphrase: "s3cret".into(),
            partners: peers(&["10.0.0.2:7000"]),
        };

        let fields = hello.build().unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], vec![0x00, 0x10]);

        assert_eq!(Hello::parse(&fields).unwrap(), hello);
    }

    #[test]
    fn test_hello_accept_parse_restores_durations() {
        let accept = HelloAccept {
            max_length: 512,
            heartbeat_period: Duration::from_secs(60),
            timeout: Duration::from_secs(120),
            partners: PeerSet::new(),
        };

        let parsed = HelloAccept::parse(&accept.build().unwrap()).unwrap();

        assert_eq!(parsed.heartbeat_period, Duration::from_secs(60));
        assert_eq!(parsed.timeout, Duration::from_secs(120));
        assert!(parsed.partners.is_empty());
    }

    #[test]
    fn test_parse_too_few_fields_returns_missing_fields() {
        let err = HelloAccept::parse(&[vec![0, 1]]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingFields {
                expected: 4,
                got: 1
            }
        ));
    }

    #[test]
    fn test_partner_change_keeps_removed_and_added_apart() {
        let change = PartnerChange {
            removed: peers(&["10.0.0.1:1"]),
            added: peers(&["10.0.0.2:2", "10.0.0.3:3"]),
        };

        let parsed = PartnerChange::parse(&change.build().unwrap()).unwrap();

        assert_eq!(parsed.removed.len(), 1);
        assert_eq!(parsed.added.len(), 2);
        assert_eq!(parsed, change);
    }

    #[test]
    fn test_client_unmark_rejects_wrong_ip_width() {
        let err = ClientUnmark::parse(&[vec![1, 2, 3, 4]]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidField(_)));
    }

    #[test]
    fn test_client_mark_build_empty_returns_error() {
        let err = ClientMark { records: vec![] }.build().unwrap_err();
        assert!(matches!(err, ProtocolError::MissingFields { .. }));
    }
}
