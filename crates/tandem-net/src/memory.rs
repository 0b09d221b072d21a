//! In-process transport for tests and single-process sessions.
//!
//! A [`MemoryNetwork`] is a shared hub; each [`MemoryTransport`] joined to it
//! has an inbox. Reliable packets are appended in send order. Fast packets
//! can be dropped or inserted out of order to imitate an unreliable link.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::address::{PeerId, Recipient};
use crate::codec::stamp_and_tag;
use crate::transport::{Channel, Transport, TransportError};

/// Fault injection for the fast channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastChannelFaults {
    /// Probability that a fast packet is lost.
    pub loss: f64,
    /// Probability that a fast packet overtakes queued packets.
    pub reorder: f64,
}

impl Default for FastChannelFaults {
    fn default() -> Self {
        Self {
            loss: 0.0,
            reorder: 0.0,
        }
    }
}

struct Hub {
    inboxes: FxHashMap<PeerId, VecDeque<Vec<u8>>>,
    faults: FastChannelFaults,
    rng: StdRng,
}

impl Hub {
    fn deliver(&mut self, channel: Channel, from: PeerId, to: Recipient, bytes: &[u8]) -> Result<(), TransportError> {
        let inbound = stamp_and_tag(channel, bytes, from)?;
        let targets: Vec<PeerId> = self
            .inboxes
            .keys()
            .copied()
            .filter(|peer| *peer != from && to.includes(*peer))
            .collect();

        for peer in targets {
            if channel == Channel::Fast && self.rng.random_bool(self.faults.loss) {
                tracing::trace!("Fast packet {from} -> {peer} lost");
                continue;
            }
            let reorder = channel == Channel::Fast && self.rng.random_bool(self.faults.reorder);
            let Some(inbox) = self.inboxes.get_mut(&peer) else {
                continue;
            };
            if reorder && !inbox.is_empty() {
                let at = self.rng.random_range(0..inbox.len());
                inbox.insert(at, inbound.clone());
            } else {
                inbox.push_back(inbound.clone());
            }
        }
        Ok(())
    }
}

/// Shared in-process hub.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl MemoryNetwork {
    /// A lossless network.
    pub fn new() -> Self {
        Self::with_faults(FastChannelFaults::default(), 0)
    }

    /// A network whose fast channel misbehaves as described by `faults`.
    pub fn with_faults(faults: FastChannelFaults, seed: u64) -> Self {
        Self {
            hub: Rc::new(RefCell::new(Hub {
                inboxes: FxHashMap::default(),
                faults,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    /// Join the network as `peer`.
    pub fn join(&self, peer: PeerId) -> MemoryTransport {
        self.hub.borrow_mut().inboxes.entry(peer).or_default();
        MemoryTransport {
            peer,
            hub: Rc::clone(&self.hub),
            open: true,
        }
    }

    /// Number of joined peers.
    pub fn peer_count(&self) -> usize {
        self.hub.borrow().inboxes.len()
    }

    /// Packets waiting in `peer`'s inbox.
    pub fn pending(&self, peer: PeerId) -> usize {
        self.hub
            .borrow()
            .inboxes
            .get(&peer)
            .map_or(0, VecDeque::len)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One peer's endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    peer: PeerId,
    hub: Rc<RefCell<Hub>>,
    open: bool,
}

impl MemoryTransport {
    fn send(&mut self, channel: Channel, to: Recipient, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.hub.borrow_mut().deliver(channel, self.peer, to, bytes)
    }
}

impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn send_reliable(&mut self, to: Recipient, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(Channel::Reliable, to, bytes)
    }

    fn send_fast(&mut self, to: Recipient, bytes: &[u8]) -> Result<(), TransportError> {
        self.send(Channel::Fast, to, bytes)
    }

    fn drain(&mut self, on_receive: &mut dyn FnMut(&[u8])) -> usize {
        if !self.open {
            return 0;
        }
        // Take the inbox first so handlers may send without re-borrowing the hub.
        let pending = {
            let mut hub = self.hub.borrow_mut();
            hub.inboxes
                .get_mut(&self.peer)
                .map(std::mem::take)
                .unwrap_or_default()
        };
        let count = pending.len();
        for packet in &pending {
            on_receive(packet);
        }
        count
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.hub.borrow_mut().inboxes.remove(&self.peer);
        tracing::debug!("{} left the memory network", self.peer);
    }
}
