//! Peer and entity identifiers.
//!
//! An entity is addressed network-wide by an [`Address64`], the
//! concatenation of a session-assigned public [`Address32`] (high half) and a
//! peer-local private [`Address32`] (low half).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a peer within a session.
///
/// `u32::MAX` is reserved: it encodes [`Recipient::Broadcast`] in packet
/// headers and "no grabber" in ownership messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    /// Raw value reserved for broadcast / "nobody".
    pub const RESERVED: u32 = u32::MAX;

    /// Returns `true` unless this is the reserved value.
    pub fn is_valid(self) -> bool {
        self.0 != Self::RESERVED
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Destination of an outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// A single peer.
    Peer(PeerId),
    /// Every other peer in the session.
    Broadcast,
}

impl Recipient {
    /// Header encoding of this recipient.
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Peer(peer) => peer.0,
            Self::Broadcast => PeerId::RESERVED,
        }
    }

    /// Decode a header recipient field.
    pub fn from_wire(raw: u32) -> Self {
        if raw == PeerId::RESERVED {
            Self::Broadcast
        } else {
            Self::Peer(PeerId(raw))
        }
    }

    /// Whether a packet with this recipient should be delivered to `peer`.
    pub fn includes(self, peer: PeerId) -> bool {
        match self {
            Self::Peer(target) => target == peer,
            Self::Broadcast => true,
        }
    }
}

/// A 4-byte entity id, unique per owner within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address32(pub u32);

impl Address32 {
    /// Serialized size in bytes.
    pub const LEN: usize = 4;

    /// Little-endian wire bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Parse from little-endian wire bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for Address32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Network-wide entity key: `(public << 32) | private`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address64(pub u64);

impl Address64 {
    /// Serialized size in bytes.
    pub const LEN: usize = 8;

    /// Compose from the public (session-assigned) and private (peer-local) halves.
    pub fn new(public: Address32, private: Address32) -> Self {
        Self((u64::from(public.0) << 32) | u64::from(private.0))
    }

    /// Session-assigned public half.
    pub fn public(self) -> Address32 {
        Address32((self.0 >> 32) as u32)
    }

    /// Peer-local private half.
    pub fn private(self) -> Address32 {
        Address32(self.0 as u32)
    }
}

impl fmt::Display for Address64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
