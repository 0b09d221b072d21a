//! Networked entities and the pose-provider seam.

use serde::{Deserialize, Serialize};

use tandem_net::{Address64, PeerId, Pose, RigidbodyFlags};

use crate::delta::SendCache;
use crate::interpolation::InterpolationState;
use crate::ownership::Ownership;
use crate::registry::Destroy;

// ---------------------------------------------------------------------------
// PoseProvider
// ---------------------------------------------------------------------------

/// The scene object behind an entity. The session reads and writes poses only
/// through this trait.
pub trait PoseProvider {
    /// Current pose.
    fn pose(&self) -> Pose;

    /// Overwrite the pose.
    fn set_pose(&mut self, pose: Pose);

    /// Opaque per-entity state sent with every transform (animation parameters).
    fn extra_state(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Apply extra state received from the driving peer.
    fn apply_extra_state(&mut self, _extra: &[u8]) {}

    /// Release the underlying resource.
    fn destroy(&mut self) {}
}

// ---------------------------------------------------------------------------
// Direction / Lifecycle
// ---------------------------------------------------------------------------

/// Which way state flows for an entity on this peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sends local state, never applies inbound state.
    SendOnly,
    /// Applies inbound state, never sends.
    RecvOnly,
    /// Both.
    #[default]
    SendRecv,
}

impl Direction {
    /// Whether local state may be sent.
    pub fn can_send(self) -> bool {
        matches!(self, Self::SendOnly | Self::SendRecv)
    }

    /// Whether inbound state may be applied.
    pub fn can_receive(self) -> bool {
        matches!(self, Self::RecvOnly | Self::SendRecv)
    }
}

/// Entity lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lifecycle {
    /// Created, not yet registered.
    Uninitialized,
    /// Live in a session.
    Initialized,
    /// Destroyed.
    ShutDown,
}

/// A lifecycle transition that did not move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal lifecycle transition {from:?} -> {to:?}")]
pub struct LifecycleError {
    /// State before the attempt.
    pub from: Lifecycle,
    /// Requested state.
    pub to: Lifecycle,
}

// ---------------------------------------------------------------------------
// RigidbodyState
// ---------------------------------------------------------------------------

/// Rigidbody flags plus the gravity hand-off used while grabbing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RigidbodyState {
    /// Flags sent with every transform.
    pub flags: RigidbodyFlags,
    /// Gravity is integrated only by the peer driving the entity.
    pub gravity_delegated: bool,
    suspended_gravity: Option<bool>,
}

impl RigidbodyState {
    /// State with the given flags.
    pub fn new(flags: RigidbodyFlags, gravity_delegated: bool) -> Self {
        Self {
            flags,
            gravity_delegated,
            suspended_gravity: None,
        }
    }

    /// Disable gravity while a local hand holds the entity.
    pub fn suspend_gravity(&mut self) {
        if self.gravity_delegated && self.suspended_gravity.is_none() {
            self.suspended_gravity = Some(self.flags.use_gravity);
            self.flags.use_gravity = false;
        }
    }

    /// Restore gravity saved by [`RigidbodyState::suspend_gravity`].
    pub fn restore_gravity(&mut self) {
        if let Some(use_gravity) = self.suspended_gravity.take() {
            self.flags.use_gravity = use_gravity;
        }
    }

    /// Whether gravity is currently suspended.
    pub fn gravity_suspended(&self) -> bool {
        self.suspended_gravity.is_some()
    }

    /// Adopt flags received from the driving peer.
    pub fn apply_remote(&mut self, flags: RigidbodyFlags) {
        match &mut self.suspended_gravity {
            Some(saved) => {
                *saved = flags.use_gravity;
                self.flags.is_kinematic = flags.is_kinematic;
            }
            None => self.flags = flags,
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkedEntity
// ---------------------------------------------------------------------------

/// A live entity shared across the session.
pub struct NetworkedEntity {
    address: Address64,
    elem_id: u32,
    user_id: PeerId,
    owner: PeerId,
    direction: Direction,
    lifecycle: Lifecycle,
    synchronized: bool,
    rigidbody: RigidbodyState,
    provider: Box<dyn PoseProvider>,
    pub(crate) ownership: Ownership,
    pub(crate) sent: SendCache,
    pub(crate) interpolation: InterpolationState,
    pub(crate) force_send: bool,
    pub(crate) replies: Vec<PeerId>,
}

impl NetworkedEntity {
    /// Wrap `provider` as entity `address`. The provider's current pose is
    /// taken as already in sync.
    pub fn new(
        address: Address64,
        elem_id: u32,
        owner: PeerId,
        direction: Direction,
        provider: Box<dyn PoseProvider>,
    ) -> Self {
        let sent = SendCache::new(provider.pose(), provider.extra_state());
        Self {
            address,
            elem_id,
            user_id: owner,
            owner,
            direction,
            lifecycle: Lifecycle::Uninitialized,
            synchronized: true,
            rigidbody: RigidbodyState::default(),
            provider,
            ownership: Ownership::default(),
            sent,
            interpolation: InterpolationState::default(),
            force_send: false,
            replies: Vec::new(),
        }
    }

    /// Network-wide key.
    pub fn address(&self) -> Address64 {
        self.address
    }

    /// Element (prefab) index.
    pub fn elem_id(&self) -> u32 {
        self.elem_id
    }

    /// User whose anchor placed the entity.
    pub fn user_id(&self) -> PeerId {
        self.user_id
    }

    pub(crate) fn set_user_id(&mut self, user_id: PeerId) {
        self.user_id = user_id;
    }

    /// Owning peer.
    pub fn owner(&self) -> PeerId {
        self.owner
    }

    /// Flow direction on this peer.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Change the flow direction.
    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    /// Lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Move the lifecycle forward.
    pub fn transition(&mut self, to: Lifecycle) -> Result<(), LifecycleError> {
        if to <= self.lifecycle {
            return Err(LifecycleError {
                from: self.lifecycle,
                to,
            });
        }
        self.lifecycle = to;
        Ok(())
    }

    /// Whether the last inbound update has been fully applied.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub(crate) fn set_synchronized(&mut self, synchronized: bool) {
        self.synchronized = synchronized;
    }

    /// Rigidbody state.
    pub fn rigidbody(&self) -> &RigidbodyState {
        &self.rigidbody
    }

    /// Mutable rigidbody state.
    pub fn rigidbody_mut(&mut self) -> &mut RigidbodyState {
        &mut self.rigidbody
    }

    /// Current pose from the provider.
    pub fn pose(&self) -> Pose {
        self.provider.pose()
    }

    /// The backing provider.
    pub fn provider(&self) -> &dyn PoseProvider {
        self.provider.as_ref()
    }

    /// The backing provider, mutably.
    pub fn provider_mut(&mut self) -> &mut dyn PoseProvider {
        self.provider.as_mut()
    }

    /// The peer whose state wins: the grabber while grabbed, else the owner.
    pub fn driver(&self) -> PeerId {
        self.ownership.state().grabber().unwrap_or(self.owner)
    }

    /// Whether an interpolation session is running.
    pub fn is_interpolating(&self) -> bool {
        self.interpolation.is_active()
    }
}

impl Destroy for NetworkedEntity {
    fn destroy(&mut self) {
        if self.transition(Lifecycle::ShutDown).is_ok() {
            self.provider.destroy();
        }
    }
}

impl std::fmt::Debug for NetworkedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkedEntity")
            .field("address", &self.address)
            .field("elem_id", &self.elem_id)
            .field("owner", &self.owner)
            .field("direction", &self.direction)
            .field("lifecycle", &self.lifecycle)
            .field("ownership", &self.ownership.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use tandem_net::Address32;

    struct Probe {
        pose: Pose,
        destroyed: Rc<Cell<u32>>,
    }

    impl PoseProvider for Probe {
        fn pose(&self) -> Pose {
            self.pose
        }
        fn set_pose(&mut self, pose: Pose) {
            self.pose = pose;
        }
        fn destroy(&mut self) {
            self.destroyed.set(self.destroyed.get() + 1);
        }
    }

    fn entity(destroyed: &Rc<Cell<u32>>) -> NetworkedEntity {
        NetworkedEntity::new(
            Address64::new(Address32(1), Address32(2)),
            0,
            PeerId(1),
            Direction::SendRecv,
            Box::new(Probe {
                pose: Pose::IDENTITY,
                destroyed: Rc::clone(destroyed),
            }),
        )
    }

    #[test]
    fn test_direction_gates() {
        assert!(Direction::SendOnly.can_send());
        assert!(!Direction::SendOnly.can_receive());
        assert!(!Direction::RecvOnly.can_send());
        assert!(Direction::RecvOnly.can_receive());
        assert!(Direction::SendRecv.can_send() && Direction::SendRecv.can_receive());
    }

    #[test]
    fn test_lifecycle_moves_forward_only() {
        let destroyed = Rc::new(Cell::new(0));
        let mut e = entity(&destroyed);
        assert_eq!(e.lifecycle(), Lifecycle::Uninitialized);
        e.transition(Lifecycle::Initialized).unwrap();
        assert_eq!(
            e.transition(Lifecycle::Uninitialized),
            Err(LifecycleError {
                from: Lifecycle::Initialized,
                to: Lifecycle::Uninitialized,
            })
        );
        assert!(e.transition(Lifecycle::Initialized).is_err());
        e.transition(Lifecycle::ShutDown).unwrap();
        assert!(e.transition(Lifecycle::Initialized).is_err());
    }

    #[test]
    fn test_destroy_runs_once() {
        let destroyed = Rc::new(Cell::new(0));
        let mut e = entity(&destroyed);
        e.destroy();
        e.destroy();
        assert_eq!(destroyed.get(), 1);
        assert_eq!(e.lifecycle(), Lifecycle::ShutDown);
    }

    #[test]
    fn test_gravity_suspended_only_when_delegated() {
        let flags = RigidbodyFlags {
            use_gravity: true,
            is_kinematic: false,
        };
        let mut local = RigidbodyState::new(flags, false);
        local.suspend_gravity();
        assert!(local.flags.use_gravity);

        let mut delegated = RigidbodyState::new(flags, true);
        delegated.suspend_gravity();
        assert!(!delegated.flags.use_gravity);
        assert!(delegated.gravity_suspended());
        delegated.restore_gravity();
        assert!(delegated.flags.use_gravity);
    }

    #[test]
    fn test_remote_flags_while_suspended_update_saved_gravity() {
        let mut rb = RigidbodyState::new(
            RigidbodyFlags {
                use_gravity: true,
                is_kinematic: false,
            },
            true,
        );
        rb.suspend_gravity();
        rb.apply_remote(RigidbodyFlags {
            use_gravity: false,
            is_kinematic: true,
        });
        assert!(!rb.flags.use_gravity);
        assert!(rb.flags.is_kinematic);
        rb.restore_gravity();
        assert!(!rb.flags.use_gravity);
    }

    #[test]
    fn test_driver_is_owner_when_free() {
        let destroyed = Rc::new(Cell::new(0));
        let e = entity(&destroyed);
        assert_eq!(e.driver(), PeerId(1));
        assert!(!e.is_interpolating());
    }
}
