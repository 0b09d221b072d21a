//! TCP relay that plays both session channels for connected peers.
//!
//! Each peer opens one TCP connection, announces its [`PeerId`] with a hello
//! frame, then sends `[channel tag][outbound packet]` frames. The relay
//! stamps the sender into each packet and forwards it in inbound layout to
//! the addressed peer or to every other peer. One ordered stream per peer
//! keeps packets of the same kind in FIFO order per sender/recipient pair.
//! When a connection drops, the relay announces a [`PeerLeft`] on its behalf.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{RwLock, mpsc, watch};

use crate::address::{PeerId, Recipient};
use crate::codec::{OutboundHeader, outbound_recipient, stamp_and_tag};
use crate::framing::{FrameConfig, read_frame, read_hello, write_frame};
use crate::messages::{MessageKind, PeerLeft, encode_control};
use crate::transport::Channel;

/// Error returned when a peer id is already connected.
#[derive(Debug, thiserror::Error)]
#[error("{0} is already connected")]
pub struct PeerAlreadyConnected(pub PeerId);

/// Outgoing frame queues of every connected peer.
pub struct RelayPeers {
    inner: RwLock<HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl RelayPeers {
    /// Create an empty peer table.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a peer's outgoing queue.
    pub async fn insert(
        &self,
        peer: PeerId,
        queue: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), PeerAlreadyConnected> {
        let mut map = self.inner.write().await;
        if map.contains_key(&peer) {
            return Err(PeerAlreadyConnected(peer));
        }
        map.insert(peer, queue);
        Ok(())
    }

    /// Remove a peer.
    pub async fn remove(&self, peer: PeerId) {
        self.inner.write().await.remove(&peer);
    }

    /// Number of connected peers.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether no peer is connected.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Queue an inbound-layout frame for every peer `to` addresses, except `from`.
    pub async fn forward(&self, from: PeerId, to: Recipient, frame: &[u8]) -> usize {
        let map = self.inner.read().await;
        let mut delivered = 0;
        for (peer, queue) in map.iter() {
            if *peer != from && to.includes(*peer) && queue.send(frame.to_vec()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl Default for RelayPeers {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for [`RelayServer`].
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Frame limits.
    pub frames: FrameConfig,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            frames: FrameConfig::default(),
        }
    }
}

/// Relay server accepting peer connections.
pub struct RelayServer {
    config: RelayServerConfig,
    /// Connected peers (public for test inspection).
    pub peers: Arc<RelayPeers>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayServer {
    /// Create a new relay with the given configuration.
    pub fn new(config: RelayServerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            peers: Arc::new(RelayPeers::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Relay listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, remote) = result?;
                    stream.set_nodelay(true)?;
                    let (reader, writer) = stream.into_split();

                    let peers = Arc::clone(&self.peers);
                    let frames = self.config.frames.clone();
                    let task_shutdown = self.shutdown_rx.clone();
                    tokio::spawn(async move {
                        Self::serve_peer(reader, writer, remote, peers, frames, task_shutdown).await;
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Relay shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the relay to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn serve_peer(
        mut reader: OwnedReadHalf,
        mut writer: tokio::net::tcp::OwnedWriteHalf,
        remote: SocketAddr,
        peers: Arc<RelayPeers>,
        frames: FrameConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let peer = match read_hello(&mut reader, &frames).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!("Rejecting {remote}: {e}");
                return;
            }
        };

        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Err(e) = peers.insert(peer, queue_tx).await {
            tracing::warn!("Rejecting {remote}: {e}");
            return;
        }
        tracing::info!("{peer} connected from {remote}");

        let writer_frames = frames.clone();
        let write_task = tokio::spawn(async move {
            while let Some(frame) = queue_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame, &writer_frames).await {
                    tracing::warn!("{peer} write failed: {e}");
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                result = read_frame(&mut reader, &frames) => {
                    match result {
                        Ok(frame) => Self::route(&peers, &frames, peer, &frame).await,
                        Err(e) => {
                            tracing::debug!("{peer} read ended: {e}");
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

        peers.remove(peer).await;
        write_task.abort();
        Self::announce_departure(&peers, peer).await;
        tracing::info!("{peer} disconnected");
    }

    async fn route(peers: &RelayPeers, frames: &FrameConfig, from: PeerId, frame: &[u8]) {
        let Some((&tag, outbound)) = frame.split_first() else {
            return;
        };
        let Some(channel) = Channel::from_tag(tag) else {
            tracing::warn!("{from} sent unknown channel tag {tag}");
            return;
        };
        let routed = outbound_recipient(outbound)
            .and_then(|to| Ok((to, stamp_and_tag(channel, outbound, from)?)));
        match routed {
            Ok((_, inbound)) if inbound.len() > frames.max_frame_size as usize => {
                tracing::warn!(
                    "Dropping frame from {from}: {} bytes once stamped exceeds maximum {}",
                    inbound.len(),
                    frames.max_frame_size
                );
            }
            Ok((to, inbound)) => {
                let delivered = peers.forward(from, to, &inbound).await;
                tracing::trace!("{from} -> {to:?}: {} bytes to {delivered} peers", inbound.len());
            }
            Err(e) => tracing::warn!("Dropping malformed frame from {from}: {e}"),
        }
    }

    async fn announce_departure(peers: &RelayPeers, peer: PeerId) {
        let mut outbound = Vec::new();
        let header = OutboundHeader::new(MessageKind::PeerLeft, Recipient::Broadcast);
        if encode_control(header, &PeerLeft { peer }, &mut outbound).is_err() {
            return;
        }
        if let Ok(inbound) = stamp_and_tag(Channel::Reliable, &outbound, peer) {
            peers.forward(peer, Recipient::Broadcast, &inbound).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let peers = RelayPeers::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        peers.insert(PeerId(1), tx.clone()).await.unwrap();
        assert!(peers.insert(PeerId(1), tx).await.is_err());
        assert_eq!(peers.len().await, 1);
    }

    #[tokio::test]
    async fn test_forward_skips_sender_and_non_targets() {
        let peers = RelayPeers::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        peers.insert(PeerId(1), tx1).await.unwrap();
        peers.insert(PeerId(2), tx2).await.unwrap();
        peers.insert(PeerId(3), tx3).await.unwrap();

        assert_eq!(peers.forward(PeerId(1), Recipient::Broadcast, b"all").await, 2);
        assert_eq!(peers.forward(PeerId(1), Recipient::Peer(PeerId(3)), b"one").await, 1);

        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), b"all");
        assert!(rx2.try_recv().is_err());
        assert_eq!(rx3.try_recv().unwrap(), b"all");
        assert_eq!(rx3.try_recv().unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_route_drops_frames_too_large_once_stamped() {
        let peers = RelayPeers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        peers.insert(PeerId(2), tx).await.unwrap();
        let frames = FrameConfig { max_frame_size: 64 };

        let frame = |body_len: usize| {
            let mut frame = vec![Channel::Reliable.tag()];
            OutboundHeader::new(MessageKind::Spawn, Recipient::Broadcast).write(&mut frame);
            frame.extend(std::iter::repeat_n(0u8, body_len));
            frame
        };

        // 52-byte body: 61-byte frame from the sender, 65 bytes once stamped.
        RelayServer::route(&peers, &frames, PeerId(1), &frame(52)).await;
        assert!(rx.try_recv().is_err());

        RelayServer::route(&peers, &frames, PeerId(1), &frame(51)).await;
        assert_eq!(rx.try_recv().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_remove_peer() {
        let peers = RelayPeers::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        peers.insert(PeerId(4), tx).await.unwrap();
        peers.remove(PeerId(4)).await;
        assert!(peers.is_empty().await);
    }
}
