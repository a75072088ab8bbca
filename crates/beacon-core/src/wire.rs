//! Beacon wire format — the packed peer record and topic rendering.
//!
//! These types ARE the protocol. A peer travels as exactly 6 bytes: four
//! address octets followed by a big-endian port. A topic travels as a DNS
//! name, `<lowercase-hex>.<domain>`. Changing either breaks interop with
//! every deployed node.

use std::fmt;
use std::net::Ipv4Addr;

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Size of one peer record on the wire.
pub const PACKED_PEER_LEN: usize = 6;

/// On-wire peer record: 4 address octets, then the port in network order.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PackedPeer {
    pub host: [u8; 4],
    pub port: [u8; 2],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PackedPeer, [u8; 6]);

/// A discoverable peer: IPv4 address and port.
///
/// The address `0.0.0.0` is a sentinel meaning "the sender's apparent
/// address"; the receiving side substitutes the source address it observed.
/// Peers are immutable values — build a new one instead of mutating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn new(host: Ipv4Addr, port: u16) -> Self {
        Self { host, port }
    }

    /// The `0.0.0.0` self-referential form used when announcing locally.
    pub fn unspecified(port: u16) -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.host.is_unspecified()
    }

    /// Replace a `0.0.0.0` host with the observed source address.
    pub fn substitute(self, src: Ipv4Addr) -> Self {
        if self.is_unspecified() {
            Self {
                host: src,
                port: self.port,
            }
        } else {
            self
        }
    }

    pub fn pack(&self) -> [u8; PACKED_PEER_LEN] {
        let packed = PackedPeer {
            host: self.host.octets(),
            port: self.port.to_be_bytes(),
        };
        let mut out = [0u8; PACKED_PEER_LEN];
        out.copy_from_slice(packed.as_bytes());
        out
    }

    pub fn unpack(bytes: &[u8]) -> Option<Self> {
        let packed = PackedPeer::read_from_prefix(bytes)?;
        Some(Self {
            host: Ipv4Addr::from(packed.host),
            port: u16::from_be_bytes(packed.port),
        })
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Pack a peer list as concatenated 6-byte records.
pub fn pack_peers(peers: &[Peer]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * PACKED_PEER_LEN);
    for peer in peers {
        out.extend_from_slice(&peer.pack());
    }
    out
}

/// Unpack concatenated 6-byte records. A trailing partial record is
/// silently ignored — truncated lists arrive routinely from other nodes.
pub fn unpack_peers(bytes: &[u8]) -> Vec<Peer> {
    bytes
        .chunks_exact(PACKED_PEER_LEN)
        .filter_map(Peer::unpack)
        .collect()
}

/// An opaque topic identifier, normalized to its wire rendering.
///
/// Raw bytes render as lowercase hex; textual ids pass through lowercased.
/// Both encodings of the same id therefore map to the same topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn from_bytes(id: &[u8]) -> Self {
        Self(hex::encode(id))
    }

    pub fn from_name(id: &str) -> Self {
        Self(id.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The DNS name this topic travels under: `<id>.<domain>`.
    pub fn fqdn(&self, domain: &str) -> String {
        format!("{}.{}", self.0, domain)
    }

    /// Recover a topic from a DNS name, if the name belongs to `domain`.
    /// Tolerates a trailing dot and mixed case.
    pub fn from_fqdn(name: &str, domain: &str) -> Option<Self> {
        let name = name.strip_suffix('.').unwrap_or(name);
        if name.len() <= domain.len() + 1 {
            return None;
        }
        let split = name.len() - domain.len() - 1;
        if !name.is_char_boundary(split) {
            return None;
        }
        let (id, suffix) = name.split_at(split);
        if !suffix.starts_with('.') || !suffix[1..].eq_ignore_ascii_case(domain) {
            return None;
        }
        Some(Self::from_name(id))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&[u8]> for Topic {
    fn from(id: &[u8]) -> Self {
        Topic::from_bytes(id)
    }
}

impl From<&str> for Topic {
    fn from(id: &str) -> Self {
        Topic::from_name(id)
    }
}
