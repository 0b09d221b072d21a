//! Entity id allocation.
//!
//! Public ids are handed out by the session's id authority in batches and
//! queued in an [`IdPool`]. Private ids are drawn locally at random. Both are
//! checked against a per-peer history so no peer ever sees the same id twice.
//!
//! Callers that need an id while the pool is empty are deferred: their
//! continuation waits in the [`AddressAllocator`] until a refill arrives or
//! the configured number of ticks passes.

use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};

use tandem_config::IdConfig;
use tandem_net::{Address32, AllocateIds, PeerId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Allocation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// No id arrived before the deadline.
    #[error("no public id available after {waited_ticks} ticks")]
    AllocationFailed {
        /// Ticks the request waited.
        waited_ticks: u32,
    },
}

// ---------------------------------------------------------------------------
// IdPool
// ---------------------------------------------------------------------------

/// FIFO of ready public ids plus the history of every id seen per peer.
#[derive(Debug, Default)]
pub struct IdPool {
    queue: VecDeque<Address32>,
    history: FxHashMap<PeerId, FxHashSet<Address32>>,
}

impl IdPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `ids` for `peer`, skipping any the peer has already seen.
    /// Returns how many were accepted.
    pub fn accept(&mut self, peer: PeerId, ids: &[Address32]) -> usize {
        let seen = self.history.entry(peer).or_default();
        let mut accepted = 0;
        for id in ids {
            if seen.insert(*id) {
                self.queue.push_back(*id);
                accepted += 1;
            } else {
                tracing::debug!("Rejecting duplicate id {id} for {peer}");
            }
        }
        accepted
    }

    /// Draw a random id `peer` has never seen and record it.
    pub fn generate<R: Rng>(&mut self, peer: PeerId, rng: &mut R) -> Address32 {
        let seen = self.history.entry(peer).or_default();
        loop {
            let candidate = Address32(rng.random());
            if seen.insert(candidate) {
                return candidate;
            }
        }
    }

    /// Take the oldest queued id.
    pub fn pop(&mut self) -> Option<Address32> {
        self.queue.pop_front()
    }

    /// Queued ids.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no id is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether `peer` has already seen `id`.
    pub fn has_seen(&self, peer: PeerId, id: Address32) -> bool {
        self.history.get(&peer).is_some_and(|seen| seen.contains(&id))
    }
}

// ---------------------------------------------------------------------------
// IdAuthority
// ---------------------------------------------------------------------------

/// Answers id allocation requests. Runs on the session's authority peer.
pub struct IdAuthority {
    issued: FxHashSet<Address32>,
    max_request: u32,
    rng: StdRng,
}

impl IdAuthority {
    /// An authority seeded from the OS.
    pub fn new(config: &IdConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// An authority with a deterministic id sequence.
    pub fn seeded(config: &IdConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &IdConfig, rng: StdRng) -> Self {
        Self {
            issued: FxHashSet::default(),
            max_request: config.max_request,
            rng,
        }
    }

    /// Issue up to `max_request` ids never issued before in this session.
    pub fn allocate(&mut self, peer: PeerId, requested: u32) -> Vec<Address32> {
        let count = requested.min(self.max_request);
        if count < requested {
            tracing::warn!("{peer} asked for {requested} ids, issuing {count}");
        }
        let mut ids = Vec::with_capacity(count as usize);
        while ids.len() < count as usize {
            let candidate = Address32(self.rng.random());
            if self.issued.insert(candidate) {
                ids.push(candidate);
            }
        }
        tracing::debug!("Issued {count} public ids to {peer}");
        ids
    }

    /// Ids issued so far.
    pub fn issued(&self) -> usize {
        self.issued.len()
    }
}

impl Default for IdAuthority {
    fn default() -> Self {
        Self::new(&IdConfig::default())
    }
}

// ---------------------------------------------------------------------------
// AddressAllocator
// ---------------------------------------------------------------------------

/// Result of [`AddressAllocator::generate`].
#[derive(Debug)]
pub enum Allocation<T> {
    /// An id was available immediately.
    Ready(Address32, T),
    /// The continuation was queued until a refill arrives.
    Deferred,
}

struct Pending<T> {
    continuation: T,
    waited_ticks: u32,
}

/// Continuations resolved by one [`AddressAllocator::tick`].
#[derive(Debug)]
pub struct AllocatorTick<T> {
    /// Continuations that received an id.
    pub ready: Vec<(Address32, T)>,
    /// Continuations that timed out.
    pub failed: Vec<(T, AllocationError)>,
}

impl<T> Default for AllocatorTick<T> {
    fn default() -> Self {
        Self {
            ready: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Hands out public ids from the pool and private ids from local randomness.
pub struct AddressAllocator<T> {
    local: PeerId,
    pool: IdPool,
    rng: StdRng,
    refill_batch: u32,
    timeout_ticks: u32,
    pending: VecDeque<Pending<T>>,
    refill_in_flight: bool,
}

impl<T> AddressAllocator<T> {
    /// Allocator for `local` using the batch size and timeout from `config`.
    pub fn new(local: PeerId, config: &IdConfig) -> Self {
        Self::with_rng(local, config, StdRng::from_os_rng())
    }

    /// Allocator with deterministic private ids.
    pub fn seeded(local: PeerId, config: &IdConfig, seed: u64) -> Self {
        Self::with_rng(local, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(local: PeerId, config: &IdConfig, rng: StdRng) -> Self {
        Self {
            local,
            pool: IdPool::new(),
            rng,
            refill_batch: config.refill_batch.max(1),
            timeout_ticks: config.allocation_timeout_ticks,
            pending: VecDeque::new(),
            refill_in_flight: false,
        }
    }

    /// Take a public id for `continuation`, or queue it until one arrives.
    ///
    /// Earlier deferred callers are served first.
    pub fn generate(&mut self, continuation: T) -> Allocation<T> {
        if self.pending.is_empty()
            && let Some(id) = self.pool.pop()
        {
            return Allocation::Ready(id, continuation);
        }
        self.pending.push_back(Pending {
            continuation,
            waited_ticks: 0,
        });
        Allocation::Deferred
    }

    /// A fresh private id for an entity owned by the local peer.
    pub fn private_id(&mut self) -> Address32 {
        self.pool.generate(self.local, &mut self.rng)
    }

    /// The refill message to send, if the pool cannot cover current demand
    /// and no request is outstanding.
    pub fn refill_request(&mut self) -> Option<AllocateIds> {
        let demand = self.pending.len().max(1);
        if self.refill_in_flight || self.pool.len() >= demand {
            return None;
        }
        let deficit = u32::try_from(demand - self.pool.len()).unwrap_or(u32::MAX);
        self.refill_in_flight = true;
        Some(AllocateIds {
            count: self.refill_batch.max(deficit),
        })
    }

    /// Feed ids received from the authority. Returns how many were new.
    pub fn on_allocated(&mut self, ids: &[Address32]) -> usize {
        self.refill_in_flight = false;
        self.pool.accept(self.local, ids)
    }

    /// Serve deferred continuations from the pool in FIFO order.
    pub fn serve(&mut self) -> Vec<(Address32, T)> {
        let mut ready = Vec::new();
        while !self.pending.is_empty()
            && let Some(id) = self.pool.pop()
            && let Some(pending) = self.pending.pop_front()
        {
            ready.push((id, pending.continuation));
        }
        ready
    }

    /// Serve what the pool allows, then age the rest and fail any that reach
    /// the timeout. A timeout of zero waits forever.
    pub fn tick(&mut self) -> AllocatorTick<T> {
        let mut out = AllocatorTick {
            ready: self.serve(),
            failed: Vec::new(),
        };

        for pending in &mut self.pending {
            pending.waited_ticks = pending.waited_ticks.saturating_add(1);
        }
        if self.timeout_ticks == 0 {
            return out;
        }
        while let Some(front) = self.pending.front()
            && front.waited_ticks >= self.timeout_ticks
        {
            let Some(expired) = self.pending.pop_front() else {
                break;
            };
            tracing::warn!("Id allocation timed out after {} ticks", expired.waited_ticks);
            out.failed.push((
                expired.continuation,
                AllocationError::AllocationFailed {
                    waited_ticks: expired.waited_ticks,
                },
            ));
        }
        if !out.failed.is_empty() {
            // The outstanding request is presumed lost; allow a new one.
            self.refill_in_flight = false;
        }
        out
    }

    /// Continuations waiting for an id.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Ids ready in the pool.
    pub fn available(&self) -> usize {
        self.pool.len()
    }

    /// Whether a refill request is outstanding.
    pub fn refill_in_flight(&self) -> bool {
        self.refill_in_flight
    }
}
