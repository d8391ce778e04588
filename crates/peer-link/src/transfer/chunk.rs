use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use signal_proto::{Frame, CHUNK_SIZE};

use super::TransferError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub sequence: u32,
    pub data: Bytes,
    pub is_final: bool,
}

impl FileChunk {
    pub fn to_frame(&self) -> Frame {
        Frame::FileChunk {
            data: STANDARD.encode(&self.data),
            sequence: self.sequence,
        }
    }
}

/// Splits a payload into [`CHUNK_SIZE`] slices numbered densely from zero.
/// Slices share the payload's buffer.
pub fn split_payload(payload: &Bytes) -> Result<Vec<FileChunk>, TransferError> {
    let total = payload.len().div_ceil(CHUNK_SIZE);
    let mut chunks = Vec::with_capacity(total);
    for index in 0..total {
        let sequence = u32::try_from(index).map_err(|_| TransferError::TooLarge {
            size: payload.len() as u64,
            limit: u64::from(u32::MAX) * CHUNK_SIZE as u64,
        })?;
        let start = index * CHUNK_SIZE;
        let end = (start + CHUNK_SIZE).min(payload.len());
        chunks.push(FileChunk {
            sequence,
            data: payload.slice(start..end),
            is_final: index + 1 == total,
        });
    }
    Ok(chunks)
}
