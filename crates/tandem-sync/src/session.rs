//! The session context.
//!
//! A [`SyncSession`] owns everything one peer needs to take part in a shared
//! session: the message registry (handlers installed at construction), the
//! per-kind scratch buffers, the entity registry, the id allocator, and the
//! transport. All work happens inside [`SyncSession::tick`] or the local
//! operations, on the caller's thread.

use rustc_hash::FxHashSet;

use tandem_config::Config;
use tandem_net::{
    Address32, Address64, AllocateIds, AllocatedIds, ControlMessage, DecodeError, Despawn, Dispatch, EncodeError,
    FullSyncRequest, GrabLock, InboundHeader, InboundPacket, LockAction, MessageKind, MessageRegistry, OutboundHeader,
    PeerId, PeerLeft, Pose, Recipient, ScratchBuffers, Spawn, SpawnRequest, TransformState, Transport, TransportError,
    TransportFacade, WireCodec, decode_control, encode_control,
};

use crate::allocator::{AddressAllocator, Allocation, AllocationError, IdAuthority};
use crate::delta::DeltaSyncPolicy;
use crate::entity::{Direction, Lifecycle, LifecycleError, NetworkedEntity, PoseProvider};
use crate::interpolation::{Advance, InterpolationEngine, Received};
use crate::ownership::{OwnershipArbiter, OwnershipError, OwnershipState};
use crate::registry::{Destroy, EntityRegistry};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Creates the scene object for a spawned element.
pub trait ElementFactory {
    /// Build a provider for `elem_id` at `pose`. `None` if the element is unknown.
    fn create(&mut self, elem_id: u32, address: Address64, pose: &Pose) -> Option<Box<dyn PoseProvider>>;
}

/// Answers where a user's spawn anchor is.
pub trait AnchorProvider {
    /// Anchor pose for `user`, if the user is known.
    fn anchor_pose(&self, user: PeerId) -> Option<Pose>;
}

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

/// Handle returned by [`SyncSession::spawn_local`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpawnTicket(pub u64);

/// Why a spawn did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnFailure {
    /// No public id arrived in time.
    #[error(transparent)]
    Allocation(#[from] AllocationError),

    /// The element factory does not know the element.
    #[error("unknown element {0}")]
    UnknownElement(u32),
}

/// Something the application should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// An entity went live on this peer.
    Spawned {
        /// Entity key.
        address: Address64,
        /// Element index.
        elem_id: u32,
        /// User the element was placed for.
        user_id: PeerId,
        /// Owning peer.
        owner: PeerId,
        /// Ticket of the local request, for local spawns.
        ticket: Option<SpawnTicket>,
    },

    /// An entity was destroyed.
    Despawned {
        /// Entity key.
        address: Address64,
    },

    /// The grab lock of an entity changed.
    OwnershipChanged {
        /// Entity key.
        address: Address64,
        /// New state.
        state: OwnershipState,
    },

    /// A spawn was abandoned.
    SpawnFailed {
        /// Ticket of the local request, for local spawns.
        ticket: Option<SpawnTicket>,
        /// Element index.
        elem_id: u32,
        /// Cause.
        reason: SpawnFailure,
    },

    /// A peer left; its entities are gone.
    PeerLeft {
        /// The departed peer.
        peer: PeerId,
    },
}

/// Errors from session operations and message handlers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// An inbound packet could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// An outbound message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The transport refused a send.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A grab-lock operation was refused.
    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    /// An entity lifecycle rule was broken.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// No entity is registered under the address.
    #[error("unknown entity {0}")]
    UnknownEntity(Address64),

    /// The anchor provider has no anchor for the user.
    #[error("no anchor for {0}")]
    NoAnchor(PeerId),
}

/// Counters from one [`SyncSession::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Packets drained from the transport.
    pub received: usize,
    /// Packets a handler accepted.
    pub dispatched: usize,
    /// Transform packets sent.
    pub transforms_sent: usize,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

struct Outbox {
    transport: TransportFacade,
    scratch: ScratchBuffers,
    codec: WireCodec,
}

impl Outbox {
    fn control<M: ControlMessage>(&mut self, to: Recipient, msg: &M) -> Result<(), SessionError> {
        let mut buf = self.scratch.acquire(M::KIND);
        encode_control(OutboundHeader::new(M::KIND, to), msg, &mut buf)?;
        self.transport.send(M::KIND, to, &buf)?;
        Ok(())
    }

    fn transform(&mut self, to: Recipient, state: &TransformState) -> Result<(), SessionError> {
        let kind = MessageKind::TransformSync;
        let mut buf = self.scratch.acquire(kind);
        self.codec
            .encode_transform(OutboundHeader::new(kind, to), state, &mut buf);
        self.transport.send(kind, to, &buf)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

struct PendingSpawn {
    ticket: Option<SpawnTicket>,
    elem_id: u32,
    user_id: PeerId,
    pose: Pose,
    direction: Direction,
}

struct SessionCore {
    local: PeerId,
    authority_peer: PeerId,
    outbox: Outbox,
    entities: EntityRegistry<Address64, NetworkedEntity>,
    allocator: AddressAllocator<PendingSpawn>,
    authority: Option<IdAuthority>,
    policy: DeltaSyncPolicy,
    interpolation: InterpolationEngine,
    arbiter: OwnershipArbiter,
    factory: Box<dyn ElementFactory>,
    anchors: Box<dyn AnchorProvider>,
    events: Vec<SessionEvent>,
    departed: FxHashSet<PeerId>,
    next_ticket: u64,
}

fn transform_of(entity: &NetworkedEntity, immediate: bool, request: bool) -> TransformState {
    TransformState {
        address: entity.address(),
        immediate,
        request,
        rigidbody: entity.rigidbody().flags,
        pose: entity.pose(),
        extra: entity.provider().extra_state(),
    }
}

impl SessionCore {
    fn build_entity(
        &mut self,
        address: Address64,
        elem_id: u32,
        owner: PeerId,
        direction: Direction,
        pose: Pose,
    ) -> Result<Option<NetworkedEntity>, SessionError> {
        let Some(mut provider) = self.factory.create(elem_id, address, &pose) else {
            return Ok(None);
        };
        provider.set_pose(pose);
        let mut entity = NetworkedEntity::new(address, elem_id, owner, direction, provider);
        entity.transition(Lifecycle::Initialized)?;
        Ok(Some(entity))
    }

    fn allocate(&mut self, pending: PendingSpawn) -> Result<(), SessionError> {
        match self.allocator.generate(pending) {
            Allocation::Ready(public, pending) => self.complete_spawn(public, pending),
            Allocation::Deferred => {
                tracing::debug!("Id pool empty, spawn deferred");
                self.pump_allocator()
            }
        }
    }

    /// Request a refill if needed and serve what the pool covers.
    fn pump_allocator(&mut self) -> Result<(), SessionError> {
        let mut result = Ok(());
        if let Some(request) = self.allocator.refill_request() {
            match self.authority.as_mut() {
                Some(authority) => {
                    let ids = authority.allocate(self.local, request.count);
                    self.allocator.on_allocated(&ids);
                }
                None => result = self.outbox.control(Recipient::Peer(self.authority_peer), &request),
            }
        }
        for (public, pending) in self.allocator.serve() {
            if let Err(e) = self.complete_spawn(public, pending) {
                tracing::warn!("Spawn failed: {e}");
            }
        }
        result
    }

    fn complete_spawn(&mut self, public: Address32, pending: PendingSpawn) -> Result<(), SessionError> {
        let private = self.allocator.private_id();
        let address = Address64::new(public, private);
        let Some(mut entity) = self.build_entity(
            address,
            pending.elem_id,
            self.local,
            pending.direction,
            pending.pose,
        )?
        else {
            tracing::warn!("No factory for element {}", pending.elem_id);
            self.events.push(SessionEvent::SpawnFailed {
                ticket: pending.ticket,
                elem_id: pending.elem_id,
                reason: SpawnFailure::UnknownElement(pending.elem_id),
            });
            return Ok(());
        };
        entity.set_user_id(pending.user_id);
        if !self.entities.register(address, entity) {
            tracing::warn!("Address {address} already live, spawn dropped");
            return Ok(());
        }
        tracing::debug!("Spawned element {} as {address}", pending.elem_id);
        self.events.push(SessionEvent::Spawned {
            address,
            elem_id: pending.elem_id,
            user_id: pending.user_id,
            owner: self.local,
            ticket: pending.ticket,
        });

        let spawn = Spawn {
            elem_id: pending.elem_id,
            user_id: pending.user_id,
            public,
            private,
            owner: self.local,
            pose: pending.pose,
        };
        self.outbox.control(Recipient::Broadcast, &spawn)
    }

    fn handle_spawn_request(&mut self, req: SpawnRequest) -> Result<(), SessionError> {
        let Some(pose) = self.anchors.anchor_pose(req.user_id) else {
            return Err(SessionError::NoAnchor(req.user_id));
        };
        self.allocate(PendingSpawn {
            ticket: None,
            elem_id: req.elem_id,
            user_id: req.user_id,
            pose,
            direction: Direction::SendRecv,
        })
    }

    fn advance_allocator(&mut self) {
        let out = self.allocator.tick();
        for (public, pending) in out.ready {
            if let Err(e) = self.complete_spawn(public, pending) {
                tracing::warn!("Spawn failed: {e}");
            }
        }
        for (pending, error) in out.failed {
            self.events.push(SessionEvent::SpawnFailed {
                ticket: pending.ticket,
                elem_id: pending.elem_id,
                reason: error.into(),
            });
        }
        if self.allocator.pending() > 0
            && let Err(e) = self.pump_allocator()
        {
            tracing::warn!("Id refill request failed: {e}");
        }
    }

    fn advance_interpolation(&mut self) {
        for (_, entity) in self.entities.iter_mut() {
            let Some(step) = self.interpolation.advance(&mut entity.interpolation) else {
                continue;
            };
            entity.provider_mut().set_pose(step.pose());
            if let Advance::Arrived(pose) = step {
                let extra = entity.provider().extra_state();
                entity.sent.record(pose, &extra);
                entity.set_synchronized(true);
            }
        }
    }

    fn send_dirty(&mut self) -> usize {
        let mut sent = 0;
        for (address, entity) in self.entities.iter_mut() {
            let force = std::mem::take(&mut entity.force_send);
            if entity.driver() != self.local || !entity.direction().can_send() || entity.is_interpolating() {
                continue;
            }
            let state = transform_of(entity, force, false);
            if !self.policy.should_send(&entity.sent, &state.pose, &state.extra, force) {
                continue;
            }
            match self.outbox.transform(Recipient::Broadcast, &state) {
                Ok(()) => {
                    entity.sent.record(state.pose, &state.extra);
                    entity.set_synchronized(false);
                    sent += 1;
                }
                Err(e) => tracing::warn!("Transform for {address} not sent: {e}"),
            }
        }
        sent
    }

    fn send_replies(&mut self) -> usize {
        let mut sent = 0;
        for (address, entity) in self.entities.iter_mut() {
            if entity.replies.is_empty() {
                continue;
            }
            let mut requesters = std::mem::take(&mut entity.replies);
            requesters.sort_unstable();
            requesters.dedup();
            let state = transform_of(entity, true, false);
            for peer in requesters {
                match self.outbox.transform(Recipient::Peer(peer), &state) {
                    Ok(()) => sent += 1,
                    Err(e) => tracing::warn!("State reply for {address} to {peer} not sent: {e}"),
                }
            }
        }
        sent
    }

    fn destroy_entity(&mut self, address: Address64) -> bool {
        let Some(mut entity) = self.entities.unregister(address) else {
            return false;
        };
        entity.destroy();
        self.events.push(SessionEvent::Despawned { address });
        true
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

type Handled = Result<(), SessionError>;

fn on_transform(core: &mut SessionCore, packet: &InboundPacket<'_>) -> Handled {
    let state = core.outbox.codec.decode_transform(packet.payload)?;
    let from = packet.header.from;
    let Some(entity) = core.entities.get_mut(state.address) else {
        tracing::warn!("Transform from {from} for unknown entity {}", state.address);
        return Ok(());
    };

    if state.request {
        entity.replies.push(from);
        return Ok(());
    }
    if !entity.direction().can_receive() {
        return Ok(());
    }
    if entity.driver() == core.local {
        tracing::trace!("Ignoring transform from {from} for locally driven {}", state.address);
        return Ok(());
    }

    entity.rigidbody_mut().apply_remote(state.rigidbody);
    entity.provider_mut().apply_extra_state(&state.extra);
    let current = entity.pose();
    match core
        .interpolation
        .receive(&mut entity.interpolation, current, state.pose, state.immediate)
    {
        Received::Apply(pose) => {
            entity.provider_mut().set_pose(pose);
            let extra = entity.provider().extra_state();
            entity.sent.record(pose, &extra);
            entity.set_synchronized(true);
        }
        Received::Smoothing => entity.set_synchronized(false),
    }
    Ok(())
}

fn on_spawn_request(core: &mut SessionCore, packet: &InboundPacket<'_>) -> Handled {
    let req: SpawnRequest = decode_control(packet.payload)?;
    match core.handle_spawn_request(req) {
        Err(SessionError::NoAnchor(user)) => {
            tracing::warn!("Spawn request from {} names {user}, who has no anchor", packet.header.from);
            Ok(())
        }
        other => other,
    }
}

fn on_spawn(core: &mut SessionCore, packet: &InboundPacket<'_>) -> Handled {
    let spawn: Spawn = decode_control(packet.payload)?;
    let address = spawn.address();
    if core.entities.contains(address) {
        tracing::trace!("Duplicate spawn for {address} dropped");
        return Ok(());
    }
    let Some(mut entity) = core.build_entity(address, spawn.elem_id, spawn.owner, Direction::SendRecv, spawn.pose)?
    else {
        tracing::warn!("Spawn of unknown element {} from {}", spawn.elem_id, packet.header.from);
        return Ok(());
    };
    entity.set_user_id(spawn.user_id);
    core.entities.register(address, entity);
    core.events.push(SessionEvent::Spawned {
        address,
        elem_id: spawn.elem_id,
        user_id: spawn.user_id,
        owner: spawn.owner,
        ticket: None,
    });
    Ok(())
}

fn on_despawn(core: &mut SessionCore, packet: &InboundPacket<'_>) -> Handled {
    let msg: Despawn = decode_control(packet.payload)?;
    if !core.destroy_entity(msg.address) {
        tracing::warn!("Despawn from {} for unknown entity {}", packet.header.from, msg.address);
    }
    Ok(())
}

fn on_grab_lock(core: &mut SessionCore, packet: &InboundPacket<'_>) -> Handled {
    let msg: GrabLock = decode_control(packet.payload)?;
    let Some(entity) = core.entities.get_mut(msg.address) else {
        tracing::warn!("Lock from {} for unknown entity {}", packet.header.from, msg.address);
        return Ok(());
    };
    let out = core.arbiter.apply_remote(&mut entity.ownership, &msg);
    if out.hands_cleared {
        entity.rigidbody_mut().restore_gravity();
        tracing::debug!("Lost {} to {:?}", msg.address, out.current);
    }
    if out.changed() {
        core.events.push(SessionEvent::OwnershipChanged {
            address: msg.address,
            state: out.current,
        });
    }
    Ok(())
}

fn on_allocate_ids(core: &mut SessionCore, packet: &InboundPacket<'_>) -> Handled {
    let req: AllocateIds = decode_control(packet.payload)?;
    let from = packet.header.from;
    let Some(authority) = core.authority.as_mut() else {
        tracing::warn!("{from} asked for ids, but this peer is not the id authority");
        return Ok(());
    };
    let ids = authority.allocate(from, req.count);
    core.outbox.control(Recipient::Peer(from), &AllocatedIds { ids })
}

fn on_allocated_ids(core: &mut SessionCore, packet: &InboundPacket<'_>) -> Handled {
    let msg: AllocatedIds = decode_control(packet.payload)?;
    let accepted = core.allocator.on_allocated(&msg.ids);
    tracing::debug!("Received {} ids, {accepted} new", msg.ids.len());
    core.pump_allocator()
}

fn on_full_sync_request(core: &mut SessionCore, packet: &InboundPacket<'_>) -> Handled {
    let _: FullSyncRequest = decode_control(packet.payload)?;
    let from = packet.header.from;
    let to = Recipient::Peer(from);
    let mut announced = 0;
    for (address, entity) in core.entities.iter_mut() {
        if entity.owner() != core.local {
            continue;
        }
        let spawn = Spawn {
            elem_id: entity.elem_id(),
            user_id: entity.user_id(),
            public: address.public(),
            private: address.private(),
            owner: core.local,
            pose: entity.pose(),
        };
        core.outbox.control(to, &spawn)?;
        let state = entity.ownership.state();
        if state.is_grabbed()
            && let Some(grabber) = state.to_grabber()
        {
            let lock = GrabLock {
                address,
                grabber,
                action: LockAction::GrabLock,
            };
            core.outbox.control(to, &lock)?;
        }
        entity.replies.push(from);
        announced += 1;
    }
    tracing::debug!("Announced {announced} entities to late joiner {from}");
    Ok(())
}

fn on_peer_left(core: &mut SessionCore, packet: &InboundPacket<'_>) -> Handled {
    let msg: PeerLeft = decode_control(packet.payload)?;
    let peer = msg.peer;
    if peer == core.local || !core.departed.insert(peer) {
        return Ok(());
    }
    for (address, mut entity) in core.entities.drain_where(|e| e.owner() == peer) {
        entity.destroy();
        core.events.push(SessionEvent::Despawned { address });
    }
    for (address, entity) in core.entities.iter_mut() {
        if core.arbiter.peer_left(&mut entity.ownership, peer) {
            core.events.push(SessionEvent::OwnershipChanged {
                address,
                state: OwnershipState::Free,
            });
        }
    }
    tracing::info!("{peer} left the session");
    core.events.push(SessionEvent::PeerLeft { peer });
    Ok(())
}

// ---------------------------------------------------------------------------
// SyncSession
// ---------------------------------------------------------------------------

/// One peer's view of a shared session.
pub struct SyncSession {
    registry: MessageRegistry<SessionCore, SessionError>,
    core: SessionCore,
}

impl SyncSession {
    /// Build a session over `transport`. The transport's peer id is the
    /// local peer; if it equals `config.session.authority_peer`, this peer
    /// also answers id allocation requests.
    pub fn new(
        config: &Config,
        transport: Box<dyn Transport>,
        factory: Box<dyn ElementFactory>,
        anchors: Box<dyn AnchorProvider>,
    ) -> Self {
        let transport = TransportFacade::new(transport);
        let local = transport.local_peer();
        let authority_peer = PeerId(config.session.authority_peer);

        let mut registry: MessageRegistry<SessionCore, SessionError> = MessageRegistry::new();
        registry.register(MessageKind::TransformSync, on_transform);
        registry.register(MessageKind::SpawnRequest, on_spawn_request);
        registry.register(MessageKind::Spawn, on_spawn);
        registry.register(MessageKind::Despawn, on_despawn);
        registry.register(MessageKind::GrabLock, on_grab_lock);
        registry.register(MessageKind::AllocateIds, on_allocate_ids);
        registry.register(MessageKind::AllocatedIds, on_allocated_ids);
        registry.register(MessageKind::FullSyncRequest, on_full_sync_request);
        registry.register(MessageKind::PeerLeft, on_peer_left);

        let core = SessionCore {
            local,
            authority_peer,
            outbox: Outbox {
                transport,
                scratch: ScratchBuffers::new(),
                codec: WireCodec::new(config.wire.numeric_width),
            },
            entities: EntityRegistry::new(),
            allocator: AddressAllocator::new(local, &config.ids),
            authority: (local == authority_peer).then(|| IdAuthority::new(&config.ids)),
            policy: DeltaSyncPolicy::from_config(&config.sync),
            interpolation: InterpolationEngine::from_config(&config.sync),
            arbiter: OwnershipArbiter::new(local),
            factory,
            anchors,
            events: Vec::new(),
            departed: FxHashSet::default(),
            next_ticket: 0,
        };
        tracing::info!(
            "Session ready for {local} (authority {authority_peer}, {} handlers, {} steps per blend)",
            registry.registered_kinds().count(),
            core.interpolation.steps()
        );
        Self { registry, core }
    }

    /// Local peer id.
    pub fn local_peer(&self) -> PeerId {
        self.core.local
    }

    /// Whether this peer answers id allocation requests.
    pub fn is_authority(&self) -> bool {
        self.core.authority.is_some()
    }

    /// Whether the transport still accepts sends.
    pub fn is_open(&self) -> bool {
        self.core.outbox.transport.is_open()
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Closed.into())
        }
    }

    /// Run one update: dispatch inbound packets, resolve id allocations,
    /// advance interpolation, send dirty entities, answer state requests.
    pub fn tick(&mut self) -> TickStats {
        let mut stats = TickStats::default();
        if !self.is_open() {
            return stats;
        }

        let mut inbound = Vec::new();
        stats.received = self
            .core
            .outbox
            .transport
            .drain(&mut |bytes| inbound.push(bytes.to_vec()));
        for bytes in &inbound {
            if let Ok((header, _)) = InboundHeader::read(bytes)
                && header.type_id != MessageKind::PeerLeft.type_id()
            {
                self.core.departed.remove(&header.from);
            }
            match self.registry.dispatch(&mut self.core, bytes) {
                Ok(Dispatch::Handled(_)) => stats.dispatched += 1,
                Ok(Dispatch::Unhandled(_)) => {}
                Err(e) => tracing::warn!("Dropping inbound packet: {e}"),
            }
        }

        self.core.advance_allocator();
        self.core.advance_interpolation();
        stats.transforms_sent = self.core.send_dirty() + self.core.send_replies();
        stats
    }

    /// Spawn element `elem_id` owned by this peer. Completes immediately when
    /// the id pool has an id, otherwise on a later tick.
    pub fn spawn_local(&mut self, elem_id: u32, pose: Pose, direction: Direction) -> Result<SpawnTicket, SessionError> {
        self.ensure_open()?;
        let ticket = SpawnTicket(self.core.next_ticket);
        self.core.next_ticket += 1;
        self.core.allocate(PendingSpawn {
            ticket: Some(ticket),
            elem_id,
            user_id: self.core.local,
            pose,
            direction,
        })?;
        Ok(ticket)
    }

    /// Ask the authority to spawn `elem_id` at `user_id`'s anchor.
    pub fn request_spawn(&mut self, elem_id: u32, user_id: PeerId) -> Result<(), SessionError> {
        self.ensure_open()?;
        let req = SpawnRequest { elem_id, user_id };
        if self.is_authority() {
            return self.core.handle_spawn_request(req);
        }
        let to = Recipient::Peer(self.core.authority_peer);
        self.core.outbox.control(to, &req)
    }

    /// Destroy an entity here and on every peer.
    pub fn despawn(&mut self, address: Address64) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.core.destroy_entity(address) {
            return Err(SessionError::UnknownEntity(address));
        }
        self.core.outbox.control(Recipient::Broadcast, &Despawn { address })
    }

    /// Add a local hand to an entity's grab lock.
    pub fn grab(&mut self, address: Address64) -> Result<(), SessionError> {
        self.ensure_open()?;
        let core = &mut self.core;
        let entity = core
            .entities
            .get_mut(address)
            .ok_or(SessionError::UnknownEntity(address))?;
        let out = core.arbiter.grab(&mut entity.ownership, address)?;
        entity.rigidbody_mut().suspend_gravity();
        entity.interpolation.cancel();
        let state = entity.ownership.state();
        if out.changed {
            core.events.push(SessionEvent::OwnershipChanged { address, state });
        }
        match out.announce {
            Some(msg) => core.outbox.control(Recipient::Broadcast, &msg),
            None => Ok(()),
        }
    }

    /// Remove a local hand. The last hand frees the entity.
    pub fn release(&mut self, address: Address64) -> Result<(), SessionError> {
        self.ensure_open()?;
        let core = &mut self.core;
        let entity = core
            .entities
            .get_mut(address)
            .ok_or(SessionError::UnknownEntity(address))?;
        let out = core.arbiter.release(&mut entity.ownership, address)?;
        if out.changed {
            entity.rigidbody_mut().restore_gravity();
            core.events.push(SessionEvent::OwnershipChanged {
                address,
                state: OwnershipState::Free,
            });
        }
        match out.announce {
            Some(msg) => core.outbox.control(Recipient::Broadcast, &msg),
            None => Ok(()),
        }
    }

    /// Free an entity on every peer, whoever holds it.
    pub fn force_release(&mut self, address: Address64) -> Result<(), SessionError> {
        self.ensure_open()?;
        let core = &mut self.core;
        let entity = core
            .entities
            .get_mut(address)
            .ok_or(SessionError::UnknownEntity(address))?;
        let (msg, changed) = core.arbiter.force_release(&mut entity.ownership, address);
        entity.rigidbody_mut().restore_gravity();
        if changed {
            core.events.push(SessionEvent::OwnershipChanged {
                address,
                state: OwnershipState::Free,
            });
        }
        core.outbox.control(Recipient::Broadcast, &msg)
    }

    /// Ask the peer driving `address` for its current state. The answer
    /// arrives as an immediate transform on a later tick. Does nothing when
    /// this peer drives the entity.
    pub fn request_state(&mut self, address: Address64) -> Result<(), SessionError> {
        self.ensure_open()?;
        let core = &mut self.core;
        let entity = core
            .entities
            .get(address)
            .ok_or(SessionError::UnknownEntity(address))?;
        let driver = entity.driver();
        if driver == core.local {
            return Ok(());
        }
        let state = transform_of(entity, false, true);
        core.outbox.transform(Recipient::Peer(driver), &state)
    }

    /// Send `address` on the next tick regardless of thresholds, applied
    /// without smoothing by receivers.
    pub fn force_sync(&mut self, address: Address64) -> Result<(), SessionError> {
        let entity = self
            .core
            .entities
            .get_mut(address)
            .ok_or(SessionError::UnknownEntity(address))?;
        entity.force_send = true;
        Ok(())
    }

    /// Announce this peer as a late joiner; every peer answers with its
    /// entities.
    pub fn join(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.core.outbox.control(Recipient::Broadcast, &FullSyncRequest)
    }

    /// Tell every peer this one is leaving, then shut down.
    pub fn leave(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        let local = self.core.local;
        let result = self.core.outbox.control(Recipient::Broadcast, &PeerLeft { peer: local });
        self.shutdown();
        result
    }

    /// Destroy every entity and close the transport.
    pub fn shutdown(&mut self) {
        self.core.entities.clear();
        self.core.outbox.transport.close();
        tracing::info!("Session for {} shut down", self.core.local);
    }

    /// Take the events raised since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.core.events)
    }

    /// Entity under `address`.
    pub fn entity(&self, address: Address64) -> Option<&NetworkedEntity> {
        self.core.entities.get(address)
    }

    /// Entity under `address`, mutably.
    pub fn entity_mut(&mut self, address: Address64) -> Option<&mut NetworkedEntity> {
        self.core.entities.get_mut(address)
    }

    /// Live entity addresses.
    pub fn addresses(&self) -> Vec<Address64> {
        self.core.entities.keys().collect()
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.core.entities.len()
    }

    /// Grab-lock state of `address`.
    pub fn ownership(&self, address: Address64) -> Option<OwnershipState> {
        self.core.entities.get(address).map(|e| e.ownership.state())
    }

    /// Spawns waiting for an id.
    pub fn pending_spawns(&self) -> usize {
        self.core.allocator.pending()
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
