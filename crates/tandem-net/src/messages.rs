//! Message kinds and control-message payloads.
//!
//! Every packet carries a 32-bit type id taken from the explicit
//! [`MessageKind`] enumeration. Pose updates ([`MessageKind::TransformSync`])
//! use the fixed-offset layout in [`crate::codec`]; every other kind carries a
//! [`postcard`]-encoded payload struct implementing [`ControlMessage`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::address::{Address32, Address64, PeerId};
use crate::codec::{DecodeError, OutboundHeader};
use crate::pose::Pose;
use crate::transport::Channel;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Centrally assigned message type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageKind {
    /// Entity pose and extra state.
    TransformSync = 1,
    /// Ask the authority to spawn an element anchored to a user.
    SpawnRequest = 2,
    /// Announce a newly spawned entity.
    Spawn = 3,
    /// Destroy an entity on every peer.
    Despawn = 4,
    /// Grab-lock acquire/release and forced release.
    GrabLock = 5,
    /// Ask the authority for fresh public ids.
    AllocateIds = 6,
    /// Authority's answer to [`MessageKind::AllocateIds`].
    AllocatedIds = 7,
    /// Late joiner asks every peer for its entities.
    FullSyncRequest = 8,
    /// A peer left the session.
    PeerLeft = 9,
}

impl MessageKind {
    /// Every kind, in type-id order.
    pub const ALL: [MessageKind; 9] = [
        Self::TransformSync,
        Self::SpawnRequest,
        Self::Spawn,
        Self::Despawn,
        Self::GrabLock,
        Self::AllocateIds,
        Self::AllocatedIds,
        Self::FullSyncRequest,
        Self::PeerLeft,
    ];

    /// Number of kinds.
    pub const COUNT: usize = Self::ALL.len();

    /// Wire type id.
    pub fn type_id(self) -> u32 {
        self as u32
    }

    /// Dense index in `0..COUNT`.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// Channel this kind travels on. Pose updates tolerate loss; everything
    /// else needs per-type FIFO delivery.
    pub fn channel(self) -> Channel {
        match self {
            Self::TransformSync => Channel::Fast,
            _ => Channel::Reliable,
        }
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = DecodeError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.type_id() == raw)
            .ok_or(DecodeError::UnknownKind(raw))
    }
}

// ---------------------------------------------------------------------------
// Control payloads
// ---------------------------------------------------------------------------

/// A payload struct bound to one [`MessageKind`].
pub trait ControlMessage: Serialize + DeserializeOwned {
    /// Kind stamped into the header.
    const KIND: MessageKind;
}

/// Ask the authority to spawn element `elem_id` at `user_id`'s anchor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Element (prefab) index.
    pub elem_id: u32,
    /// User whose anchor positions the element.
    pub user_id: PeerId,
}

/// A newly spawned entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Spawn {
    /// Element (prefab) index.
    pub elem_id: u32,
    /// User the spawn was made for.
    pub user_id: PeerId,
    /// Session-assigned public id.
    pub public: Address32,
    /// Spawner-local private id.
    pub private: Address32,
    /// Peer that owns (and by default drives) the entity.
    pub owner: PeerId,
    /// Initial pose.
    pub pose: Pose,
}

impl Spawn {
    /// Network-wide key of the spawned entity.
    pub fn address(&self) -> Address64 {
        Address64::new(self.public, self.private)
    }
}

/// Destroy an entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Despawn {
    /// Entity to destroy.
    pub address: Address64,
}

/// Grab-lock action carried by [`GrabLock`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LockAction {
    /// Announce the current grabber (or [`GRABBER_FREE`]).
    GrabLock,
    /// Unconditionally free the entity.
    ForceRelease,
}

/// Grabber value meaning "free".
pub const GRABBER_FREE: i32 = -1;

/// Grab-lock announcement. Acquire and forced release share this kind so the
/// reliable channel keeps them in order relative to each other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrabLock {
    /// Entity the lock applies to.
    pub address: Address64,
    /// Grabbing peer, or [`GRABBER_FREE`].
    pub grabber: i32,
    /// Lock action.
    pub action: LockAction,
}

/// Request `count` fresh public ids from the authority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocateIds {
    /// Number of ids wanted.
    pub count: u32,
}

/// Fresh public ids for the requester.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocatedIds {
    /// The ids, none previously issued to the requester.
    pub ids: Vec<Address32>,
}

/// Late joiner asks every peer to announce its entities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FullSyncRequest;

/// A peer left; its entities and locks go with it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerLeft {
    /// The departed peer.
    pub peer: PeerId,
}

macro_rules! control_kind {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl ControlMessage for $ty {
            const KIND: MessageKind = MessageKind::$kind;
        })*
    };
}

control_kind! {
    SpawnRequest => SpawnRequest,
    Spawn => Spawn,
    Despawn => Despawn,
    GrabLock => GrabLock,
    AllocateIds => AllocateIds,
    AllocatedIds => AllocatedIds,
    FullSyncRequest => FullSyncRequest,
    PeerLeft => PeerLeft,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding a control message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// Postcard serialization failed.
    #[error("serialization error: {0}")]
    Payload(#[from] postcard::Error),
}

/// Marshal `msg` into `buf` behind an outbound header.
pub fn encode_control<M: ControlMessage>(
    header: OutboundHeader,
    msg: &M,
    buf: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    debug_assert_eq!(header.kind, M::KIND);
    header.write(buf);
    *buf = postcard::to_extend(msg, std::mem::take(buf))?;
    Ok(())
}

/// Unmarshal a control payload (the bytes after the inbound header).
pub fn decode_control<M: ControlMessage>(payload: &[u8]) -> Result<M, DecodeError> {
    Ok(postcard::from_bytes(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Recipient;
    use crate::codec::{OUTBOUND_HEADER_LEN, stamp_and_tag};
    use crate::transport::Channel;

    #[test]
    fn test_type_ids_are_stable() {
        assert_eq!(MessageKind::TransformSync.type_id(), 1);
        assert_eq!(MessageKind::GrabLock.type_id(), 5);
        assert_eq!(MessageKind::PeerLeft.type_id(), 9);
    }

    #[test]
    fn test_index_is_dense() {
        for (i, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_unknown_type_id_rejected() {
        assert!(matches!(
            MessageKind::try_from(0xDEAD_BEEF),
            Err(DecodeError::UnknownKind(0xDEAD_BEEF))
        ));
        assert!(MessageKind::try_from(0).is_err());
    }

    #[test]
    fn test_only_transforms_use_fast_channel() {
        for kind in MessageKind::ALL {
            let expected = if kind == MessageKind::TransformSync {
                Channel::Fast
            } else {
                Channel::Reliable
            };
            assert_eq!(kind.channel(), expected);
        }
    }

    #[test]
    fn test_spawn_survives_wire() {
        let spawn = Spawn {
            elem_id: 3,
            user_id: PeerId(7),
            public: Address32(0xAABB_CCDD),
            private: Address32(0x1122_3344),
            owner: PeerId(0),
            pose: Pose::IDENTITY,
        };
        let mut buf = Vec::new();
        encode_control(
            OutboundHeader::new(MessageKind::Spawn, Recipient::Peer(PeerId(7))),
            &spawn,
            &mut buf,
        )
        .unwrap();
        assert_eq!(&buf[..4], &3u32.to_le_bytes());

        let inbound = stamp_and_tag(Channel::Reliable, &buf, PeerId(0)).unwrap();
        let (header, payload) = crate::codec::InboundHeader::read(&inbound).unwrap();
        assert_eq!(header.type_id, MessageKind::Spawn.type_id());
        let decoded: Spawn = decode_control(payload).unwrap();
        assert_eq!(decoded, spawn);
        assert_eq!(decoded.address().0, 0xAABB_CCDD_1122_3344);
        assert!(buf.len() > OUTBOUND_HEADER_LEN);
    }

    #[test]
    fn test_encode_reuses_buffer_allocation() {
        let mut buf = Vec::with_capacity(256);
        let before = buf.as_ptr();
        let lock = GrabLock {
            address: Address64(0x0102_0304_0506_0708),
            grabber: 4,
            action: LockAction::GrabLock,
        };
        encode_control(OutboundHeader::new(MessageKind::GrabLock, Recipient::Broadcast), &lock, &mut buf).unwrap();
        assert_eq!(buf.as_ptr(), before);
        assert!(buf.capacity() >= 256);
        assert_eq!(&buf[OUTBOUND_HEADER_LEN..], postcard::to_allocvec(&lock).unwrap().as_slice());
    }

    #[test]
    fn test_truncated_control_payload_rejected() {
        let result: Result<GrabLock, _> = decode_control(&[0x01]);
        assert!(matches!(result, Err(DecodeError::Payload(_))));
    }
}
