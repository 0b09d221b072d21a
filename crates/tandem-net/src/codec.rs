//! Fixed-offset packet layout.
//!
//! All raw byte access to packet headers and transform payloads lives in this
//! module. Integers are little-endian.
//!
//! ```text
//! outbound (marshalled by a sender, OUTBOUND_HEADER_LEN = 8)
//! +-------------+-----------+---------+
//! | type_id u32 | to u32    | payload |
//! +-------------+-----------+---------+
//!
//! wire (sender stamped by the transport, WIRE_HEADER_LEN = 12)
//! +-------------+-----------+-----------+---------+
//! | type_id u32 | from u32  | to u32    | payload |
//! +-------------+-----------+-----------+---------+
//!
//! inbound (handed to the receive callback, INBOUND_HEADER_LEN = 13)
//! +--------+-------------+-----------+-----------+---------+
//! | tag u8 | type_id u32 | from u32  | to u32    | payload |
//! +--------+-------------+-----------+-----------+---------+
//! ```
//!
//! The transform payload is:
//!
//! ```text
//! +---------------+-----------+---------+-------------+--------------+---------------+-------+
//! | address64 u64 | immediate | request | use_gravity | is_kinematic | numeric block | extra |
//! +---------------+-----------+---------+-------------+--------------+---------------+-------+
//! ```
//!
//! Flags are one byte each (0 or 1). The numeric block holds the ten pose
//! values in [`Pose::to_array`] order, 4 bytes each at
//! [`NumericWidth::Float32`] or 2 bytes each at [`NumericWidth::Float16`]. The
//! width is not recorded in the packet. Extra bytes run to the end of the
//! packet.
//!
//! # Half-precision error
//!
//! binary16 keeps 10 fraction bits. With round-to-nearest, a value whose
//! magnitude lies in the normal range `[2^-14, 65504]` decodes with relative
//! error at most `2^-11`. Smaller magnitudes are subnormal and keep an
//! absolute error of at most `2^-25`; magnitudes above 65504 saturate to
//! infinity, so positions must stay well inside that range.

#[cfg(target_endian = "big")]
compile_error!("the transform numeric block is copied in host byte order and assumes little-endian");

use half::f16;

use crate::address::{Address64, PeerId, Recipient};
use crate::messages::MessageKind;
use crate::pose::{POSE_VALUES, Pose};
use crate::transport::Channel;
use tandem_config::NumericWidth;

/// Header length of a marshalled outbound packet.
pub const OUTBOUND_HEADER_LEN: usize = 8;

/// Header length once the transport has stamped the sender.
pub const WIRE_HEADER_LEN: usize = 12;

/// Header length of a packet handed to the receive callback.
pub const INBOUND_HEADER_LEN: usize = 13;

/// Bytes a packet grows by between outbound and inbound layout.
pub const STAMP_OVERHEAD: usize = INBOUND_HEADER_LEN - OUTBOUND_HEADER_LEN;

const FLAGS_OFFSET: usize = Address64::LEN;
const NUMERIC_OFFSET: usize = FLAGS_OFFSET + 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than the layout requires.
    #[error("truncated packet: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// The type id names no known message kind.
    #[error("unknown message type id {0:#010x}")]
    UnknownKind(u32),

    /// A flag byte was neither 0 nor 1.
    #[error("invalid flag byte {value} at offset {offset}")]
    InvalidFlag {
        /// Payload offset of the flag.
        offset: usize,
        /// Byte found.
        value: u8,
    },

    /// The channel tag byte was not recognized.
    #[error("invalid channel tag {0}")]
    InvalidChannel(u8),

    /// Postcard deserialization failed.
    #[error("payload error: {0}")]
    Payload(#[from] postcard::Error),
}

fn ensure_len(bytes: &[u8], needed: usize) -> Result<(), DecodeError> {
    if bytes.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Header written by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundHeader {
    /// Message kind.
    pub kind: MessageKind,
    /// Destination.
    pub to: Recipient,
}

impl OutboundHeader {
    /// Create a header.
    pub fn new(kind: MessageKind, to: Recipient) -> Self {
        Self { kind, to }
    }

    /// Append the header to `buf`.
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.kind.type_id().to_le_bytes());
        buf.extend_from_slice(&self.to.to_wire().to_le_bytes());
    }
}

/// Header as seen by the receive callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundHeader {
    /// Channel the packet arrived on.
    pub channel: Channel,
    /// Raw type id; may name a kind this build does not know.
    pub type_id: u32,
    /// Sending peer.
    pub from: PeerId,
    /// Destination as addressed by the sender.
    pub to: Recipient,
}

impl InboundHeader {
    /// Split an inbound packet into its header and payload.
    pub fn read(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        ensure_len(bytes, INBOUND_HEADER_LEN)?;
        let channel = Channel::from_tag(bytes[0]).ok_or(DecodeError::InvalidChannel(bytes[0]))?;
        let header = Self {
            channel,
            type_id: read_u32(bytes, 1),
            from: PeerId(read_u32(bytes, 5)),
            to: Recipient::from_wire(read_u32(bytes, 9)),
        };
        Ok((header, &bytes[INBOUND_HEADER_LEN..]))
    }

    /// Peek only the type id of an inbound packet.
    pub fn peek_type_id(bytes: &[u8]) -> Result<u32, DecodeError> {
        ensure_len(bytes, INBOUND_HEADER_LEN)?;
        Ok(read_u32(bytes, 1))
    }
}

/// Destination of a marshalled outbound packet.
pub fn outbound_recipient(outbound: &[u8]) -> Result<Recipient, DecodeError> {
    ensure_len(outbound, OUTBOUND_HEADER_LEN)?;
    Ok(Recipient::from_wire(read_u32(outbound, 4)))
}

/// Insert the sender between type id and recipient (outbound → wire).
pub fn stamp_sender(outbound: &[u8], from: PeerId) -> Result<Vec<u8>, DecodeError> {
    ensure_len(outbound, OUTBOUND_HEADER_LEN)?;
    let mut wire = Vec::with_capacity(outbound.len() + 4);
    wire.extend_from_slice(&outbound[..4]);
    wire.extend_from_slice(&from.0.to_le_bytes());
    wire.extend_from_slice(&outbound[4..]);
    Ok(wire)
}

/// Prepend the receiving channel tag (wire → inbound).
pub fn tag_inbound(channel: Channel, wire: &[u8]) -> Result<Vec<u8>, DecodeError> {
    ensure_len(wire, WIRE_HEADER_LEN)?;
    let mut inbound = Vec::with_capacity(wire.len() + 1);
    inbound.push(channel.tag());
    inbound.extend_from_slice(wire);
    Ok(inbound)
}

/// Outbound straight to inbound, for transports that do both hops in one place.
pub fn stamp_and_tag(channel: Channel, outbound: &[u8], from: PeerId) -> Result<Vec<u8>, DecodeError> {
    tag_inbound(channel, &stamp_sender(outbound, from)?)
}

// ---------------------------------------------------------------------------
// Transform payload
// ---------------------------------------------------------------------------

/// Rigidbody flags carried with every transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RigidbodyFlags {
    /// Gravity integration enabled.
    pub use_gravity: bool,
    /// Body is driven kinematically.
    pub is_kinematic: bool,
}

impl Default for RigidbodyFlags {
    fn default() -> Self {
        Self {
            use_gravity: false,
            is_kinematic: true,
        }
    }
}

/// Decoded [`MessageKind::TransformSync`] payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformState {
    /// Target entity.
    pub address: Address64,
    /// Apply without smoothing.
    pub immediate: bool,
    /// Sender asks for our current full state.
    pub request: bool,
    /// Rigidbody flags.
    pub rigidbody: RigidbodyFlags,
    /// Entity pose.
    pub pose: Pose,
    /// Opaque per-entity state (animation parameters).
    pub extra: Vec<u8>,
}

/// Encoder/decoder for transform payloads at a fixed numeric width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    width: NumericWidth,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(NumericWidth::build_default())
    }
}

impl WireCodec {
    /// Create a codec for `width`.
    pub fn new(width: NumericWidth) -> Self {
        Self { width }
    }

    /// Numeric width in use.
    pub fn width(&self) -> NumericWidth {
        self.width
    }

    /// Size of the numeric block in bytes.
    pub fn numeric_block_len(&self) -> usize {
        POSE_VALUES * self.width.bytes_per_value()
    }

    /// Payload size of a transform with no extra bytes.
    pub fn transform_payload_len(&self) -> usize {
        NUMERIC_OFFSET + self.numeric_block_len()
    }

    /// Marshal a transform behind `header` into `buf`.
    pub fn encode_transform(&self, header: OutboundHeader, state: &TransformState, buf: &mut Vec<u8>) {
        debug_assert_eq!(header.kind, MessageKind::TransformSync);
        buf.reserve(OUTBOUND_HEADER_LEN + self.transform_payload_len() + state.extra.len());
        header.write(buf);
        buf.extend_from_slice(&state.address.0.to_le_bytes());
        buf.extend_from_slice(&[
            u8::from(state.immediate),
            u8::from(state.request),
            u8::from(state.rigidbody.use_gravity),
            u8::from(state.rigidbody.is_kinematic),
        ]);

        let values = state.pose.to_array();
        match self.width {
            NumericWidth::Float32 => buf.extend_from_slice(bytemuck::cast_slice(&values)),
            NumericWidth::Float16 => {
                let halves = values.map(f16::from_f32);
                buf.extend_from_slice(bytemuck::cast_slice(&halves));
            }
        }
        buf.extend_from_slice(&state.extra);
    }

    /// Unmarshal a transform payload (the bytes after the inbound header).
    pub fn decode_transform(&self, payload: &[u8]) -> Result<TransformState, DecodeError> {
        let numeric_end = self.transform_payload_len();
        ensure_len(payload, numeric_end)?;

        let mut address = [0u8; 8];
        address.copy_from_slice(&payload[..Address64::LEN]);

        let flag = |i: usize| -> Result<bool, DecodeError> {
            let offset = FLAGS_OFFSET + i;
            match payload[offset] {
                0 => Ok(false),
                1 => Ok(true),
                value => Err(DecodeError::InvalidFlag { offset, value }),
            }
        };

        let block = &payload[NUMERIC_OFFSET..numeric_end];
        let pose = match self.width {
            NumericWidth::Float32 => {
                let mut values = [0f32; POSE_VALUES];
                bytemuck::cast_slice_mut::<f32, u8>(&mut values).copy_from_slice(block);
                Pose::from_array(values)
            }
            NumericWidth::Float16 => {
                let mut halves = [f16::ZERO; POSE_VALUES];
                bytemuck::cast_slice_mut::<f16, u8>(&mut halves).copy_from_slice(block);
                let mut pose = Pose::from_array(halves.map(f16::to_f32));
                if pose.rotation.length_squared() > 0.0 {
                    pose.rotation = pose.rotation.normalize();
                }
                pose
            }
        };

        Ok(TransformState {
            address: Address64(u64::from_le_bytes(address)),
            immediate: flag(0)?,
            request: flag(1)?,
            rigidbody: RigidbodyFlags {
                use_gravity: flag(2)?,
                is_kinematic: flag(3)?,
            },
            pose,
            extra: payload[numeric_end..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address32;
    use glam::{Quat, Vec3};

    fn sample_state() -> TransformState {
        TransformState {
            address: Address64::new(Address32(0xAABB_CCDD), Address32(0x1122_3344)),
            immediate: true,
            request: false,
            rigidbody: RigidbodyFlags {
                use_gravity: true,
                is_kinematic: false,
            },
            pose: Pose::new(
                Vec3::new(1.25, -3.5, 0.001),
                Quat::from_rotation_y(0.7).normalize(),
                Vec3::new(1.0, 2.0, 0.5),
            ),
            extra: vec![9, 8, 7],
        }
    }

    fn marshal(codec: &WireCodec, state: &TransformState, to: Recipient) -> Vec<u8> {
        let mut buf = Vec::new();
        codec.encode_transform(
            OutboundHeader::new(MessageKind::TransformSync, to),
            state,
            &mut buf,
        );
        buf
    }

    #[test]
    fn test_header_lengths_differ_by_hop() {
        let codec = WireCodec::new(NumericWidth::Float32);
        let outbound = marshal(&codec, &sample_state(), Recipient::Broadcast);
        let wire = stamp_sender(&outbound, PeerId(4)).unwrap();
        let inbound = tag_inbound(Channel::Fast, &wire).unwrap();

        assert_eq!(wire.len(), outbound.len() + WIRE_HEADER_LEN - OUTBOUND_HEADER_LEN);
        assert_eq!(inbound.len(), outbound.len() + INBOUND_HEADER_LEN - OUTBOUND_HEADER_LEN);
        assert_eq!(&wire[4..8], &4u32.to_le_bytes());
        assert_eq!(inbound[0], Channel::Fast.tag());
    }

    #[test]
    fn test_inbound_header_fields() {
        let codec = WireCodec::new(NumericWidth::Float32);
        let outbound = marshal(&codec, &sample_state(), Recipient::Peer(PeerId(2)));
        let inbound = stamp_and_tag(Channel::Reliable, &outbound, PeerId(9)).unwrap();

        let (header, payload) = InboundHeader::read(&inbound).unwrap();
        assert_eq!(header.channel, Channel::Reliable);
        assert_eq!(header.type_id, MessageKind::TransformSync.type_id());
        assert_eq!(header.from, PeerId(9));
        assert_eq!(header.to, Recipient::Peer(PeerId(2)));
        assert_eq!(payload.len(), codec.transform_payload_len() + 3);
        assert_eq!(InboundHeader::peek_type_id(&inbound).unwrap(), 1);
    }

    #[test]
    fn test_float32_roundtrip_is_exact() {
        let codec = WireCodec::new(NumericWidth::Float32);
        let state = sample_state();
        let inbound = stamp_and_tag(Channel::Fast, &marshal(&codec, &state, Recipient::Broadcast), PeerId(1)).unwrap();
        let (_, payload) = InboundHeader::read(&inbound).unwrap();
        assert_eq!(codec.decode_transform(payload).unwrap(), state);
    }

    #[test]
    fn test_float16_roundtrip_within_bound() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use std::f32::consts::PI;

        let codec = WireCodec::new(NumericWidth::Float16);
        let bound = 2f32.powi(-10);
        let mut rng = StdRng::seed_from_u64(16);
        let mut state = sample_state();

        for _ in 0..5_000 {
            state.pose = Pose::new(
                Vec3::new(
                    rng.random_range(-4096.0..4096.0),
                    rng.random_range(-4096.0..4096.0),
                    rng.random_range(-4096.0..4096.0),
                ),
                Quat::from_euler(
                    glam::EulerRot::YXZ,
                    rng.random_range(-PI..PI),
                    rng.random_range(-1.5..1.5),
                    rng.random_range(-PI..PI),
                ),
                Vec3::new(
                    rng.random_range(0.01..16.0),
                    rng.random_range(0.01..16.0),
                    rng.random_range(0.01..16.0),
                ),
            );
            let outbound = marshal(&codec, &state, Recipient::Broadcast);
            let inbound = stamp_and_tag(Channel::Fast, &outbound, PeerId(1)).unwrap();
            let (_, payload) = InboundHeader::read(&inbound).unwrap();
            let decoded = codec.decode_transform(payload).unwrap();

            assert_eq!(decoded.address, state.address);
            assert_eq!(decoded.rigidbody, state.rigidbody);
            assert_eq!(decoded.extra, state.extra);
            let expected = state.pose.to_array();
            for (i, got) in decoded.pose.to_array().into_iter().enumerate() {
                let want = expected[i];
                let err = (got - want).abs();
                assert!(
                    err <= bound * want.abs().max(2f32.powi(-14)),
                    "value {i}: {want} decoded as {got}"
                );
            }
        }
    }

    #[test]
    fn test_numeric_block_sizes() {
        assert_eq!(WireCodec::new(NumericWidth::Float32).numeric_block_len(), 40);
        assert_eq!(WireCodec::new(NumericWidth::Float16).numeric_block_len(), 20);
        assert_eq!(WireCodec::new(NumericWidth::Float32).transform_payload_len(), 52);
    }

    #[test]
    fn test_flags_are_single_bytes_at_fixed_offsets() {
        let codec = WireCodec::new(NumericWidth::Float32);
        let outbound = marshal(&codec, &sample_state(), Recipient::Broadcast);
        let flags = &outbound[OUTBOUND_HEADER_LEN + FLAGS_OFFSET..OUTBOUND_HEADER_LEN + NUMERIC_OFFSET];
        assert_eq!(flags, &[1, 0, 1, 0]);
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let codec = WireCodec::new(NumericWidth::Float32);
        let result = codec.decode_transform(&[0u8; 20]);
        assert!(matches!(
            result,
            Err(DecodeError::Truncated { needed: 52, available: 20 })
        ));
    }

    #[test]
    fn test_width_mismatch_is_not_detected_but_bounded() {
        // A float16 packet decoded as float32 is too short without extras.
        let half = WireCodec::new(NumericWidth::Float16);
        let full = WireCodec::new(NumericWidth::Float32);
        let mut state = sample_state();
        state.extra.clear();
        let inbound = stamp_and_tag(Channel::Fast, &marshal(&half, &state, Recipient::Broadcast), PeerId(1)).unwrap();
        let (_, payload) = InboundHeader::read(&inbound).unwrap();
        assert!(matches!(
            full.decode_transform(payload),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_flag_rejected() {
        let codec = WireCodec::new(NumericWidth::Float32);
        let mut outbound = marshal(&codec, &sample_state(), Recipient::Broadcast);
        outbound[OUTBOUND_HEADER_LEN + FLAGS_OFFSET + 1] = 7;
        let inbound = stamp_and_tag(Channel::Fast, &outbound, PeerId(1)).unwrap();
        let (_, payload) = InboundHeader::read(&inbound).unwrap();
        assert!(matches!(
            codec.decode_transform(payload),
            Err(DecodeError::InvalidFlag { offset: 9, value: 7 })
        ));
    }

    #[test]
    fn test_short_headers_rejected() {
        assert!(stamp_sender(&[1, 2, 3], PeerId(0)).is_err());
        assert!(tag_inbound(Channel::Fast, &[0u8; 11]).is_err());
        assert!(InboundHeader::read(&[0u8; 12]).is_err());
        assert!(matches!(
            InboundHeader::read(&[5u8; 13]),
            Err(DecodeError::InvalidChannel(5))
        ));
    }
}
