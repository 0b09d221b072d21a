//! Length-prefixed framing for relay TCP streams.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   frame            |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself. The first frame a peer
//! sends is a hello carrying its [`PeerId`]; every later frame is a channel
//! tag byte followed by a packet (outbound layout towards the relay, inbound
//! layout from the relay).

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::address::PeerId;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed frame size in bytes.
    pub max_frame_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 65_536,
        }
    }
}

impl From<&tandem_config::RelayConfig> for FrameConfig {
    fn from(config: &tandem_config::RelayConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame size exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// The actual frame size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The hello frame was not a 4-byte peer id.
    #[error("malformed hello frame of {0} bytes")]
    BadHello(usize),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Read a single length-prefixed frame from the stream.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(eof_as_closed)?;

    let frame_len = u32::from_le_bytes(len_buf);
    if frame_len > config.max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: frame_len,
            max: config.max_frame_size,
        });
    }

    let mut frame = vec![0u8; frame_len as usize];
    if frame_len > 0 {
        reader.read_exact(&mut frame).await.map_err(eof_as_closed)?;
    }
    Ok(frame)
}

/// Write a single length-prefixed frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
    if len > config.max_frame_size {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: config.max_frame_size,
        });
    }

    writer.write_all(&len.to_le_bytes()).await?;
    if !frame.is_empty() {
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Send the hello frame identifying this peer.
pub async fn write_hello<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    peer: PeerId,
    config: &FrameConfig,
) -> Result<(), FrameError> {
    write_frame(writer, &peer.0.to_le_bytes(), config).await
}

/// Read the hello frame and return the announced peer.
pub async fn read_hello<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<PeerId, FrameError> {
    let frame = read_frame(reader, config).await?;
    let bytes: [u8; 4] = frame
        .as_slice()
        .try_into()
        .map_err(|_| FrameError::BadHello(frame.len()))?;
    Ok(PeerId(u32::from_le_bytes(bytes)))
}
