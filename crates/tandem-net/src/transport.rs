//! Send/receive surface over the reliable and fast channels.
//!
//! A [`Transport`] takes marshalled outbound packets (see [`crate::codec`]),
//! stamps the local peer as sender, and delivers inbound packets to a
//! receive callback during [`Transport::drain`]. Draining happens on the
//! session tick, so handlers never run concurrently with encoding.

use crate::address::{PeerId, Recipient};
use crate::codec::DecodeError;
use crate::messages::MessageKind;

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered, reliable broadcast. FIFO per sender/recipient pair.
    Reliable,
    /// Low-latency, best effort. No ordering or delivery guarantee.
    Fast,
}

impl Channel {
    /// Tag byte prepended to inbound packets.
    pub fn tag(self) -> u8 {
        match self {
            Self::Reliable => 0,
            Self::Fast => 1,
        }
    }

    /// Parse an inbound tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Reliable),
            1 => Some(Self::Fast),
            _ => None,
        }
    }
}

/// Errors that can occur while sending.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport was closed; the send was discarded.
    #[error("transport closed")]
    Closed,

    /// The packet exceeds the transport's frame limit.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Packet size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The outbound packet header could not be read.
    #[error("malformed outbound packet: {0}")]
    Malformed(#[from] DecodeError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A two-channel packet transport.
pub trait Transport {
    /// Peer id stamped on every packet sent through this transport.
    fn local_peer(&self) -> PeerId;

    /// Send on the reliable channel.
    fn send_reliable(&mut self, to: Recipient, bytes: &[u8]) -> Result<(), TransportError>;

    /// Send on the fast channel.
    fn send_fast(&mut self, to: Recipient, bytes: &[u8]) -> Result<(), TransportError>;

    /// Hand every pending inbound packet to `on_receive`. Returns the count.
    fn drain(&mut self, on_receive: &mut dyn FnMut(&[u8])) -> usize;

    /// Whether sends are still accepted.
    fn is_open(&self) -> bool;

    /// Stop receiving and discard anything not yet on the wire.
    fn close(&mut self);
}

/// Picks the channel for each message kind and forwards to a [`Transport`].
pub struct TransportFacade {
    inner: Box<dyn Transport>,
}

impl TransportFacade {
    /// Wrap a transport.
    pub fn new(inner: Box<dyn Transport>) -> Self {
        Self { inner }
    }

    /// Local peer id.
    pub fn local_peer(&self) -> PeerId {
        self.inner.local_peer()
    }

    /// Send a marshalled packet of `kind` on its channel.
    pub fn send(&mut self, kind: MessageKind, to: Recipient, bytes: &[u8]) -> Result<(), TransportError> {
        match kind.channel() {
            Channel::Reliable => self.inner.send_reliable(to, bytes),
            Channel::Fast => self.inner.send_fast(to, bytes),
        }
    }

    /// Drain inbound packets into `on_receive`.
    pub fn drain(&mut self, on_receive: &mut dyn FnMut(&[u8])) -> usize {
        self.inner.drain(on_receive)
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Close the transport.
    pub fn close(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type SendLog = Rc<RefCell<Vec<(Channel, Vec<u8>)>>>;

    struct Recording {
        log: SendLog,
        open: bool,
    }

    impl Transport for Recording {
        fn local_peer(&self) -> PeerId {
            PeerId(1)
        }
        fn send_reliable(&mut self, _to: Recipient, bytes: &[u8]) -> Result<(), TransportError> {
            self.log.borrow_mut().push((Channel::Reliable, bytes.to_vec()));
            Ok(())
        }
        fn send_fast(&mut self, _to: Recipient, bytes: &[u8]) -> Result<(), TransportError> {
            self.log.borrow_mut().push((Channel::Fast, bytes.to_vec()));
            Ok(())
        }
        fn drain(&mut self, _on_receive: &mut dyn FnMut(&[u8])) -> usize {
            0
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn close(&mut self) {
            self.open = false;
        }
    }

    #[test]
    fn test_channel_tags_roundtrip() {
        for channel in [Channel::Reliable, Channel::Fast] {
            assert_eq!(Channel::from_tag(channel.tag()), Some(channel));
        }
        assert_eq!(Channel::from_tag(2), None);
    }

    #[test]
    fn test_facade_routes_by_kind() {
        let log = SendLog::default();
        let mut facade = TransportFacade::new(Box::new(Recording {
            log: Rc::clone(&log),
            open: true,
        }));
        facade
            .send(MessageKind::TransformSync, Recipient::Broadcast, &[1])
            .unwrap();
        facade
            .send(MessageKind::GrabLock, Recipient::Broadcast, &[2])
            .unwrap();

        assert_eq!(
            *log.borrow(),
            vec![(Channel::Fast, vec![1]), (Channel::Reliable, vec![2])]
        );
        assert_eq!(facade.local_peer(), PeerId(1));
    }

    #[test]
    fn test_facade_close() {
        let mut facade = TransportFacade::new(Box::new(Recording {
            log: SendLog::default(),
            open: true,
        }));
        assert!(facade.is_open());
        facade.close();
        assert!(!facade.is_open());
    }
}
