//! Moving text and files over an open data channel.
//!
//! Files travel as one `file-start` frame, base64 `file-chunk` frames in
//! ascending sequence and one `file-end` frame. There are no per-chunk
//! acknowledgements; the data channel is reliable and ordered, and the
//! receiver still tolerates reordering and duplicates.

pub mod chunk;
pub mod reassembly;

use bytes::Bytes;
use signal_proto::{FileMetadata, Frame};
use thiserror::Error;
use tracing::debug;

use crate::session::{DataChannel, ProviderError};

pub use chunk::{split_payload, FileChunk};
pub use reassembly::Reassembler;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("expected {expected} chunks, received {received}")]
    Incomplete { expected: u64, received: u64 },
    #[error("announced {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },
    #[error("file of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error(transparent)]
    Channel(#[from] ProviderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A new `file-start` arrived before `file-end`.
    Superseded,
    /// The channel or its session went away mid-transfer.
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub payload: Bytes,
}

/// What the receive side hands to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Text(String),
    FileStarted(FileMetadata),
    FileReceived(ReceivedFile),
    FileFailed {
        metadata: FileMetadata,
        error: TransferError,
    },
    Aborted {
        metadata: FileMetadata,
        received_chunks: usize,
        reason: AbortReason,
    },
}

async fn send_frame(channel: &dyn DataChannel, frame: &Frame) -> Result<(), TransferError> {
    let text = frame
        .encode()
        .map_err(|err| TransferError::Encode(err.to_string()))?;
    channel.send_text(text).await?;
    Ok(())
}

pub async fn send_text(channel: &dyn DataChannel, text: String) -> Result<(), TransferError> {
    send_frame(channel, &Frame::Text { text }).await
}

/// Streams `payload` as a complete file transfer. `metadata.size` must match
/// the payload length.
pub async fn send_file(
    channel: &dyn DataChannel,
    metadata: &FileMetadata,
    payload: Bytes,
) -> Result<(), TransferError> {
    let actual = payload.len() as u64;
    if metadata.size != actual {
        return Err(TransferError::SizeMismatch {
            expected: metadata.size,
            received: actual,
        });
    }
    let chunks = split_payload(&payload)?;
    send_frame(
        channel,
        &Frame::FileStart {
            metadata: metadata.clone(),
        },
    )
    .await?;
    for chunk in &chunks {
        send_frame(channel, &chunk.to_frame()).await?;
    }
    send_frame(
        channel,
        &Frame::FileEnd {
            name: metadata.name.clone(),
        },
    )
    .await?;
    debug!(
        target: "peer_link::transfer",
        name = %metadata.name,
        size = metadata.size,
        chunks = chunks.len(),
        label = channel.label(),
        "file sent"
    );
    Ok(())
}
