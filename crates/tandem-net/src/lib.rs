//! Wire layer for shared sessions: addressing, packet layout, control
//! messages, dispatch, and the transports that move packets between peers.

pub mod address;
pub mod codec;
pub mod framing;
pub mod memory;
pub mod messages;
pub mod pose;
pub mod relay;
pub mod relay_client;
pub mod routing;
pub mod scratch;
pub mod transport;

pub use address::{Address32, Address64, PeerId, Recipient};
pub use codec::{
    DecodeError, INBOUND_HEADER_LEN, InboundHeader, OUTBOUND_HEADER_LEN, OutboundHeader, RigidbodyFlags,
    STAMP_OVERHEAD, TransformState, WIRE_HEADER_LEN, WireCodec,
};
pub use framing::{FrameConfig, FrameError, read_frame, write_frame};
pub use memory::{FastChannelFaults, MemoryNetwork, MemoryTransport};
pub use messages::{
    AllocateIds, AllocatedIds, ControlMessage, Despawn, EncodeError, FullSyncRequest, GRABBER_FREE, GrabLock,
    LockAction, MessageKind, PeerLeft, Spawn, SpawnRequest, decode_control, encode_control,
};
pub use pose::Pose;
pub use relay::{RelayServer, RelayServerConfig};
pub use relay_client::{ConnectionState, ConnectionStateWatch, RelayTransport};
pub use routing::{Dispatch, InboundPacket, MessageHandler, MessageRegistry};
pub use scratch::{ScratchBuffers, ScratchGuard};
pub use transport::{Channel, Transport, TransportError, TransportFacade};
