//! Grab-lock arbitration.
//!
//! An entity is either free or owned by one grabbing peer. A local grab is
//! allowed when the entity is free or already held locally (a second hand
//! joining). Remote announcements overwrite the local view unconditionally,
//! so the last message delivered wins.
//!
//! Acquire and forced release travel as the same message kind, which keeps
//! them in FIFO order relative to each other on the reliable channel.

use tandem_net::{Address64, GRABBER_FREE, GrabLock, LockAction, PeerId};

/// Errors from local lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OwnershipError {
    /// Another peer holds the lock.
    #[error("entity is held by {0}")]
    HeldByRemote(PeerId),

    /// The local peer holds no hand on the entity.
    #[error("entity is not held locally")]
    NotOwner,

    /// The peer id has no wire grabber value.
    #[error("{0} cannot be announced as a grabber")]
    UnannounceableGrabber(PeerId),
}

/// Lock state of one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OwnershipState {
    /// Nobody holds the entity.
    #[default]
    Free,
    /// Held by this peer.
    OwnedBy(PeerId),
}

impl OwnershipState {
    /// Decode a wire grabber value.
    pub fn from_grabber(grabber: i32) -> Self {
        match u32::try_from(grabber) {
            Ok(raw) if grabber != GRABBER_FREE && PeerId(raw).is_valid() => Self::OwnedBy(PeerId(raw)),
            _ => Self::Free,
        }
    }

    /// Wire grabber value. `None` for peers above `i32::MAX`.
    pub fn to_grabber(self) -> Option<i32> {
        match self {
            Self::Free => Some(GRABBER_FREE),
            Self::OwnedBy(peer) => i32::try_from(peer.0).ok(),
        }
    }

    /// The grabbing peer, if any.
    pub fn grabber(self) -> Option<PeerId> {
        match self {
            Self::Free => None,
            Self::OwnedBy(peer) => Some(peer),
        }
    }

    /// Whether any peer holds the entity.
    pub fn is_grabbed(self) -> bool {
        self != Self::Free
    }

    /// Whether `peer` holds the entity.
    pub fn is_owned_by(self, peer: PeerId) -> bool {
        self == Self::OwnedBy(peer)
    }
}

/// Lock state plus the number of local hands holding the entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ownership {
    state: OwnershipState,
    local_hands: u32,
}

impl Ownership {
    /// Current state.
    pub fn state(&self) -> OwnershipState {
        self.state
    }

    /// Local hands holding the entity.
    pub fn local_hands(&self) -> u32 {
        self.local_hands
    }
}

/// What a local grab or release did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalLock {
    /// Announcement to broadcast, if the lock changed hands.
    pub announce: Option<GrabLock>,
    /// Whether the state went from free to held, or held to free.
    pub changed: bool,
}

/// Result of applying a remote lock message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteLock {
    /// State before the message.
    pub previous: OwnershipState,
    /// State after the message.
    pub current: OwnershipState,
    /// Local hands were dropped because the lock moved away.
    pub hands_cleared: bool,
}

impl RemoteLock {
    /// Whether the state changed.
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Runs the lock protocol for the local peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipArbiter {
    local: PeerId,
}

impl OwnershipArbiter {
    /// Arbiter acting for `local`.
    pub fn new(local: PeerId) -> Self {
        Self { local }
    }

    /// Local peer.
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Add a local hand. Permitted when free or already held locally; every
    /// successful grab re-announces the lock.
    pub fn grab(&self, own: &mut Ownership, address: Address64) -> Result<LocalLock, OwnershipError> {
        match own.state {
            OwnershipState::OwnedBy(peer) if peer != self.local => {
                return Err(OwnershipError::HeldByRemote(peer));
            }
            _ => {}
        }
        let grabber = OwnershipState::OwnedBy(self.local)
            .to_grabber()
            .ok_or(OwnershipError::UnannounceableGrabber(self.local))?;
        let changed = own.state == OwnershipState::Free;
        own.state = OwnershipState::OwnedBy(self.local);
        own.local_hands += 1;
        Ok(LocalLock {
            announce: Some(GrabLock {
                address,
                grabber,
                action: LockAction::GrabLock,
            }),
            changed,
        })
    }

    /// Remove a local hand. The last hand frees the entity and announces it.
    pub fn release(&self, own: &mut Ownership, address: Address64) -> Result<LocalLock, OwnershipError> {
        if own.local_hands == 0 || !own.state.is_owned_by(self.local) {
            return Err(OwnershipError::NotOwner);
        }
        own.local_hands -= 1;
        if own.local_hands > 0 {
            return Ok(LocalLock {
                announce: None,
                changed: false,
            });
        }
        own.state = OwnershipState::Free;
        Ok(LocalLock {
            announce: Some(GrabLock {
                address,
                grabber: GRABBER_FREE,
                action: LockAction::GrabLock,
            }),
            changed: true,
        })
    }

    /// Free the entity regardless of who holds it and build the broadcast.
    pub fn force_release(&self, own: &mut Ownership, address: Address64) -> (GrabLock, bool) {
        let changed = own.state != OwnershipState::Free;
        own.state = OwnershipState::Free;
        own.local_hands = 0;
        (
            GrabLock {
                address,
                grabber: GRABBER_FREE,
                action: LockAction::ForceRelease,
            },
            changed,
        )
    }

    /// Apply a lock message from another peer. Never answers, so a forced
    /// release does not echo.
    pub fn apply_remote(&self, own: &mut Ownership, msg: &GrabLock) -> RemoteLock {
        let previous = own.state;
        own.state = match msg.action {
            LockAction::GrabLock => OwnershipState::from_grabber(msg.grabber),
            LockAction::ForceRelease => OwnershipState::Free,
        };
        let hands_cleared = own.local_hands > 0 && !own.state.is_owned_by(self.local);
        if hands_cleared {
            own.local_hands = 0;
        }
        RemoteLock {
            previous,
            current: own.state,
            hands_cleared,
        }
    }

    /// Free the entity if `peer` held it. Returns whether it did.
    pub fn peer_left(&self, own: &mut Ownership, peer: PeerId) -> bool {
        if own.state.is_owned_by(peer) {
            own.state = OwnershipState::Free;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_net::Address32;

    const LOCAL: PeerId = PeerId(1);
    const REMOTE: PeerId = PeerId(2);

    fn addr() -> Address64 {
        Address64::new(Address32(1), Address32(1))
    }

    fn lock(grabber: i32) -> GrabLock {
        GrabLock {
            address: addr(),
            grabber,
            action: LockAction::GrabLock,
        }
    }

    #[test]
    fn test_grabber_wire_values() {
        assert_eq!(OwnershipState::from_grabber(-1), OwnershipState::Free);
        assert_eq!(OwnershipState::from_grabber(-7), OwnershipState::Free);
        assert_eq!(OwnershipState::from_grabber(3), OwnershipState::OwnedBy(PeerId(3)));
        assert_eq!(OwnershipState::OwnedBy(PeerId(3)).to_grabber(), Some(3));
        assert_eq!(OwnershipState::Free.to_grabber(), Some(GRABBER_FREE));
        assert_eq!(OwnershipState::OwnedBy(PeerId(0x8000_0000)).to_grabber(), None);
    }

    #[test]
    fn test_grab_free_entity_announces() {
        let arbiter = OwnershipArbiter::new(LOCAL);
        let mut own = Ownership::default();
        let out = arbiter.grab(&mut own, addr()).unwrap();
        assert!(out.changed);
        assert_eq!(out.announce, Some(lock(1)));
        assert_eq!(own.state(), OwnershipState::OwnedBy(LOCAL));
    }

    #[test]
    fn test_grab_by_peer_above_i32_range_refused() {
        let largest = PeerId(i32::MAX as u32);
        let mut own = Ownership::default();
        let out = OwnershipArbiter::new(largest).grab(&mut own, addr()).unwrap();
        assert_eq!(out.announce.map(|msg| msg.grabber), Some(i32::MAX));

        let beyond = PeerId(0x8000_0000);
        let mut own = Ownership::default();
        assert_eq!(
            OwnershipArbiter::new(beyond).grab(&mut own, addr()),
            Err(OwnershipError::UnannounceableGrabber(beyond))
        );
        assert_eq!(own.state(), OwnershipState::Free);
        assert_eq!(own.local_hands(), 0);
    }

    #[test]
    fn test_reentrant_grab_needs_every_hand_released() {
        let arbiter = OwnershipArbiter::new(LOCAL);
        let mut own = Ownership::default();
        arbiter.grab(&mut own, addr()).unwrap();
        let second = arbiter.grab(&mut own, addr()).unwrap();
        assert!(!second.changed);
        assert_eq!(own.local_hands(), 2);

        let first_release = arbiter.release(&mut own, addr()).unwrap();
        assert_eq!(first_release.announce, None);
        assert!(own.state().is_owned_by(LOCAL));

        let last_release = arbiter.release(&mut own, addr()).unwrap();
        assert_eq!(last_release.announce, Some(lock(GRABBER_FREE)));
        assert_eq!(own.state(), OwnershipState::Free);
    }

    #[test]
    fn test_grab_held_by_remote_refused() {
        let arbiter = OwnershipArbiter::new(LOCAL);
        let mut own = Ownership::default();
        arbiter.apply_remote(&mut own, &lock(2));
        assert_eq!(
            arbiter.grab(&mut own, addr()),
            Err(OwnershipError::HeldByRemote(REMOTE))
        );
        assert_eq!(arbiter.release(&mut own, addr()), Err(OwnershipError::NotOwner));
    }

    #[test]
    fn test_last_writer_wins() {
        let arbiter = OwnershipArbiter::new(LOCAL);
        let mut own = Ownership::default();
        for grabber in [2, 5, -1, 3] {
            arbiter.apply_remote(&mut own, &lock(grabber));
        }
        assert_eq!(own.state(), OwnershipState::OwnedBy(PeerId(3)));

        let forced = GrabLock {
            action: LockAction::ForceRelease,
            ..lock(4)
        };
        arbiter.apply_remote(&mut own, &forced);
        assert_eq!(own.state(), OwnershipState::Free);
    }

    #[test]
    fn test_remote_overwrite_clears_local_hands() {
        let arbiter = OwnershipArbiter::new(LOCAL);
        let mut own = Ownership::default();
        arbiter.grab(&mut own, addr()).unwrap();
        let out = arbiter.apply_remote(&mut own, &lock(2));
        assert!(out.hands_cleared);
        assert!(out.changed());
        assert_eq!(own.local_hands(), 0);
    }

    #[test]
    fn test_remote_force_release_frees_without_echo() {
        let arbiter = OwnershipArbiter::new(LOCAL);
        let mut own = Ownership::default();
        arbiter.grab(&mut own, addr()).unwrap();
        let forced = GrabLock {
            address: addr(),
            grabber: GRABBER_FREE,
            action: LockAction::ForceRelease,
        };
        let out = arbiter.apply_remote(&mut own, &forced);
        assert_eq!(out.current, OwnershipState::Free);
        assert!(out.hands_cleared);
    }

    #[test]
    fn test_local_force_release() {
        let arbiter = OwnershipArbiter::new(LOCAL);
        let mut own = Ownership::default();
        arbiter.apply_remote(&mut own, &lock(2));
        let (msg, changed) = arbiter.force_release(&mut own, addr());
        assert!(changed);
        assert_eq!(msg.action, LockAction::ForceRelease);
        assert_eq!(own.state(), OwnershipState::Free);
    }

    #[test]
    fn test_peer_left_frees_only_its_locks() {
        let arbiter = OwnershipArbiter::new(LOCAL);
        let mut own = Ownership::default();
        arbiter.apply_remote(&mut own, &lock(2));
        assert!(!arbiter.peer_left(&mut own, PeerId(3)));
        assert!(arbiter.peer_left(&mut own, REMOTE));
        assert_eq!(own.state(), OwnershipState::Free);
    }
}
