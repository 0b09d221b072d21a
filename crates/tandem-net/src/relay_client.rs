//! [`Transport`] over a TCP connection to a [`crate::relay::RelayServer`].
//!
//! Sends are queued to a writer task and never block the session tick.
//! A reader task collects inbound frames; [`Transport::drain`] hands them to
//! the session in arrival order. State changes are broadcast via a [`watch`]
//! channel so other tasks can react to a lost relay without polling.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::address::{PeerId, Recipient};
use crate::codec::STAMP_OVERHEAD;
use crate::framing::{FrameConfig, FrameError, read_frame, write_frame, write_hello};
use crate::transport::{Channel, Transport, TransportError};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to reach the relay.
    Connecting,
    /// Hello sent, packets flowing.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Relay-backed transport. Must be created inside a tokio runtime.
pub struct RelayTransport {
    peer: PeerId,
    frames: FrameConfig,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    state: Arc<ConnectionStateWatch>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayTransport {
    /// Connect to the relay at `addr` and announce `peer`.
    pub async fn connect(addr: SocketAddr, peer: PeerId, frames: FrameConfig) -> Result<Self, FrameError> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                state.set(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        write_hello(&mut writer, peer, &frames).await?;
        state.set(ConnectionState::Connected);
        tracing::info!("{peer} connected to relay {addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let reader_state = Arc::clone(&state);
        let reader_frames = frames.clone();
        let mut reader_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            Self::read_loop(reader, inbound_tx, &reader_frames, &reader_state, &mut reader_shutdown).await;
        });

        let writer_state = Arc::clone(&state);
        let writer_frames = frames.clone();
        let mut writer_shutdown = shutdown_rx;
        tokio::spawn(async move {
            Self::write_loop(writer, outbound_rx, &writer_frames, &writer_state, &mut writer_shutdown).await;
        });

        Ok(Self {
            peer,
            frames,
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            state,
            shutdown_tx,
        })
    }

    /// Connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    // The relay forwards the packet with the sender stamped and the channel
    // tag in front, so the limit applies to that forwarded size.
    fn enqueue(&mut self, channel: Channel, bytes: &[u8]) -> Result<(), TransportError> {
        let max = self.frames.max_frame_size as usize;
        let forwarded = bytes.len() + STAMP_OVERHEAD;
        if forwarded > max {
            return Err(TransportError::FrameTooLarge { size: forwarded, max });
        }
        let Some(outbound) = &self.outbound else {
            return Err(TransportError::Closed);
        };
        let mut frame = Vec::with_capacity(bytes.len() + 1);
        frame.push(channel.tag());
        frame.extend_from_slice(bytes);
        outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        inbound: mpsc::UnboundedSender<Vec<u8>>,
        frames: &FrameConfig,
        state: &ConnectionStateWatch,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = read_frame(&mut reader, frames) => {
                    match result {
                        Ok(frame) => {
                            if inbound.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Relay connection lost: {e}");
                            state.set(ConnectionState::Disconnected);
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
        frames: &FrameConfig,
        state: &ConnectionStateWatch,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                next = outbound.recv() => {
                    let Some(frame) = next else {
                        break;
                    };
                    if let Err(e) = write_frame(&mut writer, &frame, frames).await {
                        tracing::warn!("Relay write failed: {e}");
                        state.set(ConnectionState::Disconnected);
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl Transport for RelayTransport {
    fn local_peer(&self) -> PeerId {
        self.peer
    }

    fn send_reliable(&mut self, _to: Recipient, bytes: &[u8]) -> Result<(), TransportError> {
        self.enqueue(Channel::Reliable, bytes)
    }

    // The relay carries both channels on one stream, so fast packets arrive
    // in order too; receivers must not rely on it.
    fn send_fast(&mut self, _to: Recipient, bytes: &[u8]) -> Result<(), TransportError> {
        self.enqueue(Channel::Fast, bytes)
    }

    fn drain(&mut self, on_receive: &mut dyn FnMut(&[u8])) -> usize {
        if self.outbound.is_none() {
            return 0;
        }
        let mut count = 0;
        while let Ok(frame) = self.inbound.try_recv() {
            on_receive(&frame);
            count += 1;
        }
        count
    }

    fn is_open(&self) -> bool {
        self.outbound.is_some() && self.state.current() == ConnectionState::Connected
    }

    fn close(&mut self) {
        if self.outbound.take().is_none() {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.inbound.close();
        self.state.set(ConnectionState::Disconnected);
        tracing::debug!("{} closed relay transport", self.peer);
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::codec::{InboundHeader, OUTBOUND_HEADER_LEN, OutboundHeader};
    use crate::messages::{MessageKind, PeerLeft, decode_control};
    use crate::relay::{RelayServer, RelayServerConfig};

    async fn start_relay() -> (Arc<RelayServer>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(RelayServer::new(RelayServerConfig {
            bind_addr: addr,
            frames: FrameConfig::default(),
        }));
        let running = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = running.run_with_listener(listener).await;
        });
        (server, addr)
    }

    async fn wait_for_peers(server: &RelayServer, count: usize) {
        for _ in 0..200 {
            if server.peers.len().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("relay never reached {count} peers");
    }

    async fn receive_one(transport: &mut RelayTransport) -> Vec<u8> {
        for _ in 0..200 {
            let mut got = Vec::new();
            transport.drain(&mut |bytes| got.push(bytes.to_vec()));
            if let Some(first) = got.into_iter().next() {
                return first;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("nothing arrived");
    }

    fn outbound(kind: MessageKind, to: Recipient, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        OutboundHeader::new(kind, to).write(&mut buf);
        buf.extend_from_slice(body);
        buf
    }

    #[tokio::test]
    async fn test_packet_relayed_with_sender_stamped() {
        let (server, addr) = start_relay().await;
        let mut a = RelayTransport::connect(addr, PeerId(1), FrameConfig::default()).await.unwrap();
        let mut b = RelayTransport::connect(addr, PeerId(2), FrameConfig::default()).await.unwrap();
        wait_for_peers(&server, 2).await;

        let to = Recipient::Peer(PeerId(2));
        a.send_fast(to, &outbound(MessageKind::TransformSync, to, &[4, 5])).unwrap();

        let inbound = receive_one(&mut b).await;
        let (header, payload) = InboundHeader::read(&inbound).unwrap();
        assert_eq!(header.channel, Channel::Fast);
        assert_eq!(header.from, PeerId(1));
        assert_eq!(header.to, to);
        assert_eq!(payload, &[4, 5]);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_departure_announced_to_remaining_peers() {
        let (server, addr) = start_relay().await;
        let mut a = RelayTransport::connect(addr, PeerId(1), FrameConfig::default()).await.unwrap();
        let mut b = RelayTransport::connect(addr, PeerId(2), FrameConfig::default()).await.unwrap();
        wait_for_peers(&server, 2).await;

        b.close();
        assert!(!b.is_open());

        let inbound = receive_one(&mut a).await;
        let (header, payload) = InboundHeader::read(&inbound).unwrap();
        assert_eq!(header.type_id, MessageKind::PeerLeft.type_id());
        let left: PeerLeft = decode_control(payload).unwrap();
        assert_eq!(left.peer, PeerId(2));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_sends() {
        let (server, addr) = start_relay().await;
        let mut a = RelayTransport::connect(addr, PeerId(1), FrameConfig::default()).await.unwrap();
        assert!(a.is_open());
        a.close();
        let to = Recipient::Broadcast;
        assert!(matches!(
            a.send_reliable(to, &outbound(MessageKind::Despawn, to, &[])),
            Err(TransportError::Closed)
        ));
        assert_eq!(a.state().current(), ConnectionState::Disconnected);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let (server, addr) = start_relay().await;
        let mut a = RelayTransport::connect(addr, PeerId(1), FrameConfig { max_frame_size: 32 })
            .await
            .unwrap();
        let to = Recipient::Broadcast;
        let result = a.send_reliable(to, &outbound(MessageKind::Spawn, to, &[0u8; 64]));
        assert!(matches!(result, Err(TransportError::FrameTooLarge { .. })));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_limit_counts_relay_stamp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let frames = FrameConfig { max_frame_size: 64 };
        let server = Arc::new(RelayServer::new(RelayServerConfig {
            bind_addr: addr,
            frames: frames.clone(),
        }));
        let running = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = running.run_with_listener(listener).await;
        });

        let mut a = RelayTransport::connect(addr, PeerId(1), frames.clone()).await.unwrap();
        let mut b = RelayTransport::connect(addr, PeerId(2), frames).await.unwrap();
        wait_for_peers(&server, 2).await;

        let to = Recipient::Peer(PeerId(2));
        let largest_body = 64 - STAMP_OVERHEAD - OUTBOUND_HEADER_LEN;
        let too_big = outbound(MessageKind::Spawn, to, &vec![1u8; largest_body + 1]);
        assert!(matches!(
            a.send_reliable(to, &too_big),
            Err(TransportError::FrameTooLarge { size: 65, max: 64 })
        ));

        let fits = outbound(MessageKind::Spawn, to, &vec![2u8; largest_body]);
        a.send_reliable(to, &fits).unwrap();
        a.send_reliable(to, &outbound(MessageKind::Despawn, to, &[3])).unwrap();

        let mut got = Vec::new();
        for _ in 0..200 {
            b.drain(&mut |bytes| got.push(bytes.to_vec()));
            if got.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].len(), 64);
        let (header, payload) = InboundHeader::read(&got[1]).unwrap();
        assert_eq!(header.type_id, MessageKind::Despawn.type_id());
        assert_eq!(payload, &[3]);
        assert!(b.is_open());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_missing_relay_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(RelayTransport::connect(addr, PeerId(1), FrameConfig::default()).await.is_err());
    }
}
