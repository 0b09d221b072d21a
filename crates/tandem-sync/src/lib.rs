//! Shared-session state sync: id allocation, entity registry, delta sends,
//! interpolation of remote updates, and grab-lock ownership.
//!
//! [`SyncSession`] ties these together over a [`tandem_net::Transport`].

pub mod allocator;
pub mod delta;
pub mod entity;
pub mod interpolation;
pub mod ownership;
pub mod registry;
pub mod session;

pub use allocator::{AddressAllocator, Allocation, AllocationError, AllocatorTick, IdAuthority, IdPool};
pub use delta::{DeltaSyncPolicy, SendCache};
pub use entity::{Direction, Lifecycle, LifecycleError, NetworkedEntity, PoseProvider, RigidbodyState};
pub use interpolation::{
    Advance, BASE_TICK_RATE, InterpolationEngine, InterpolationSession, InterpolationState, Received, step_count,
};
pub use ownership::{LocalLock, Ownership, OwnershipArbiter, OwnershipError, OwnershipState, RemoteLock};
pub use registry::{Destroy, EntityRegistry};
pub use session::{
    AnchorProvider, ElementFactory, SessionError, SessionEvent, SpawnFailure, SpawnTicket, SyncSession, TickStats,
};
