use std::collections::BTreeMap;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use signal_proto::{expected_chunks, FileMetadata, Frame, CHUNK_SIZE};
use tracing::{debug, info, warn};

use super::{AbortReason, ReceivedFile, TransferError, TransferEvent};

#[derive(Debug)]
struct OpenTransfer {
    metadata: FileMetadata,
    expected: u64,
    chunks: BTreeMap<u32, Bytes>,
    started_at: Instant,
}

/// Receive side of one data channel. Holds at most one open transfer.
#[derive(Debug)]
pub struct Reassembler {
    max_file_bytes: u64,
    open: Option<OpenTransfer>,
}

impl Reassembler {
    pub fn new(max_file_bytes: u64) -> Self {
        Self {
            max_file_bytes,
            open: None,
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.open.is_some()
    }

    /// Feeds one inbound channel message. Anything that is not a recognised
    /// frame is passed through as text.
    pub fn handle_message(&mut self, text: &str) -> Vec<TransferEvent> {
        match Frame::parse(text) {
            Some(Frame::Text { text }) => vec![TransferEvent::Text(text)],
            Some(Frame::FileStart { metadata }) => self.start(metadata),
            Some(Frame::FileChunk { data, sequence }) => {
                self.chunk(&data, sequence);
                Vec::new()
            }
            Some(Frame::FileEnd { name }) => self.finish(&name).into_iter().collect(),
            None => vec![TransferEvent::Text(text.to_string())],
        }
    }

    /// Discards the open transfer, if any.
    pub fn abort(&mut self, reason: AbortReason) -> Option<TransferEvent> {
        let open = self.open.take()?;
        warn!(
            target: "peer_link::transfer",
            name = %open.metadata.name,
            received = open.chunks.len(),
            expected = open.expected,
            ?reason,
            "transfer aborted"
        );
        Some(TransferEvent::Aborted {
            metadata: open.metadata,
            received_chunks: open.chunks.len(),
            reason,
        })
    }

    fn start(&mut self, metadata: FileMetadata) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        if let Some(aborted) = self.abort(AbortReason::Superseded) {
            events.push(aborted);
        }
        if metadata.size > self.max_file_bytes {
            warn!(
                target: "peer_link::transfer",
                name = %metadata.name,
                size = metadata.size,
                limit = self.max_file_bytes,
                "refusing oversized transfer"
            );
            let error = TransferError::TooLarge {
                size: metadata.size,
                limit: self.max_file_bytes,
            };
            events.push(TransferEvent::FileFailed { metadata, error });
            return events;
        }
        debug!(
            target: "peer_link::transfer",
            name = %metadata.name,
            size = metadata.size,
            "transfer started"
        );
        self.open = Some(OpenTransfer {
            expected: expected_chunks(metadata.size),
            metadata: metadata.clone(),
            chunks: BTreeMap::new(),
            started_at: Instant::now(),
        });
        events.push(TransferEvent::FileStarted(metadata));
        events
    }

    fn chunk(&mut self, data: &str, sequence: u32) {
        let Some(open) = self.open.as_mut() else {
            warn!(target: "peer_link::transfer", sequence, "chunk without open transfer dropped");
            return;
        };
        if u64::from(sequence) >= open.expected {
            warn!(
                target: "peer_link::transfer",
                sequence,
                expected = open.expected,
                "chunk sequence out of range dropped"
            );
            return;
        }
        let bytes = match STANDARD.decode(data) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "peer_link::transfer", sequence, error = %err, "undecodable chunk dropped");
                return;
            }
        };
        if bytes.len() > CHUNK_SIZE {
            warn!(
                target: "peer_link::transfer",
                sequence,
                len = bytes.len(),
                "oversized chunk dropped"
            );
            return;
        }
        if open.chunks.insert(sequence, Bytes::from(bytes)).is_some() {
            debug!(target: "peer_link::transfer", sequence, "duplicate chunk replaced");
        }
    }

    fn finish(&mut self, name: &str) -> Option<TransferEvent> {
        let Some(open) = self.open.take() else {
            warn!(target: "peer_link::transfer", name, "file-end without open transfer");
            return None;
        };
        if open.metadata.name != name {
            warn!(
                target: "peer_link::transfer",
                announced = %open.metadata.name,
                name,
                "file-end name differs from file-start"
            );
        }

        let received = open.chunks.len() as u64;
        if received != open.expected {
            let error = TransferError::Incomplete {
                expected: open.expected,
                received,
            };
            warn!(target: "peer_link::transfer", name = %open.metadata.name, %error, "transfer failed");
            return Some(TransferEvent::FileFailed {
                metadata: open.metadata,
                error,
            });
        }

        let mut payload = BytesMut::with_capacity(open.metadata.size as usize);
        for chunk in open.chunks.values() {
            payload.extend_from_slice(chunk);
        }
        if payload.len() as u64 != open.metadata.size {
            let error = TransferError::SizeMismatch {
                expected: open.metadata.size,
                received: payload.len() as u64,
            };
            warn!(target: "peer_link::transfer", name = %open.metadata.name, %error, "transfer failed");
            return Some(TransferEvent::FileFailed {
                metadata: open.metadata,
                error,
            });
        }

        info!(
            target: "peer_link::transfer",
            name = %open.metadata.name,
            size = open.metadata.size,
            elapsed_ms = open.started_at.elapsed().as_millis() as u64,
            "file received"
        );
        Some(TransferEvent::FileReceived(ReceivedFile {
            metadata: open.metadata,
            payload: payload.freeze(),
        }))
    }
}
