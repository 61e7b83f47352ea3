//! Peer addresses and partner sets in their wire form.
//!
//! An address travels as 18 bytes: the 16-byte IPv6 form of the IP
//! (IPv4 is carried IPv4-mapped) followed by the port, little-endian.
//! A partner set is just those records back to back.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Length of an encoded IP.
pub const IP_LEN: usize = 16;

/// Length of an encoded `(IP, port)` record.
pub const ADDRESS_LEN: usize = IP_LEN + 2;

/// Encodes an IP in its 16-byte form.
pub fn encode_ip(ip: IpAddr) -> [u8; IP_LEN] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Decodes a 16-byte IP. The all-zero address is rejected.
pub fn decode_ip(data: &[u8]) -> Result<IpAddr, ProtocolError> {
    let octets: [u8; IP_LEN] = data.try_into().map_err(|_| {
        ProtocolError::InvalidField(format!(
            "IP must be {IP_LEN} bytes, got {}",
            data.len()
        ))
    })?;

    if octets == [0u8; IP_LEN] {
        return Err(ProtocolError::InvalidField("empty IP address".into()));
    }

    let v6 = Ipv6Addr::from(octets);
    Ok(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    })
}

/// Encodes an `(IP, port)` pair.
pub fn encode_address(addr: SocketAddr) -> [u8; ADDRESS_LEN] {
    let mut out = [0u8; ADDRESS_LEN];
    out[..IP_LEN].copy_from_slice(&encode_ip(addr.ip()));
    out[IP_LEN..].copy_from_slice(&addr.port().to_le_bytes());
    out
}

/// Decodes an 18-byte `(IP, port)` record.
pub fn decode_address(data: &[u8]) -> Result<SocketAddr, ProtocolError> {
    if data.len() != ADDRESS_LEN {
        return Err(ProtocolError::InvalidField(format!(
            "address must be {ADDRESS_LEN} bytes, got {}",
            data.len()
        )));
    }
    let ip = decode_ip(&data[..IP_LEN])?;
    let port = u16::from_le_bytes([data[IP_LEN], data[IP_LEN + 1]]);
    Ok(SocketAddr::new(ip, port))
}

// ---------------------------------------------------------------------------
// PeerSet
// ---------------------------------------------------------------------------

/// A set of peer addresses already known to be part of the mesh.
///
/// Used only to avoid redundant edges, never for routing. Ordered so that
/// the encoding and log output are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerSet(BTreeSet<SocketAddr>);

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `addr`; returns `false` if it was already present.
    pub fn insert(&mut self, addr: SocketAddr) -> bool {
        self.0.insert(addr)
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> bool {
        self.0.remove(addr)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.0.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.0.iter()
    }

    /// Addresses present in both sets.
    pub fn intersection(&self, other: &PeerSet) -> PeerSet {
        PeerSet(self.0.intersection(&other.0).copied().collect())
    }

    /// Returns `true` if the sets share at least one address.
    pub fn intersects(&self, other: &PeerSet) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    /// Adds every address of `other`.
    pub fn extend_from(&mut self, other: &PeerSet) {
        self.0.extend(other.0.iter().copied());
    }

    /// Removes every address of `other`.
    pub fn subtract(&mut self, other: &PeerSet) {
        for addr in &other.0 {
            self.0.remove(addr);
        }
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Encodes the set as consecutive address records.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * ADDRESS_LEN);
        for addr in &self.0 {
            out.extend_from_slice(&encode_address(*addr));
        }
        out
    }

    /// Decodes consecutive address records.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() % ADDRESS_LEN != 0 {
            return Err(ProtocolError::InvalidField(format!(
                "partner set length {} is not a multiple of {ADDRESS_LEN}",
                data.len()
            )));
        }
        data.chunks_exact(ADDRESS_LEN).map(decode_address).collect()
    }
}

impl FromIterator<SocketAddr> for PeerSet {
    fn from_iter<I: IntoIterator<Item = SocketAddr>>(iter: I) -> Self {
        PeerSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PeerSet {
    type Item = &'a SocketAddr;
    type IntoIter = std::collections::btree_set::Iter<'a, SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for PeerSet {
    type Item = SocketAddr;
    type IntoIter = std::collections::btree_set::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
