//! File transfer over the multiplexed channel
//!
//! A transfer is one `file-metadata` envelope followed by `file-chunk`
//! headers, each paired with a binary frame of at most the configured chunk
//! size. [`FileSender`] produces that sequence, [`Reassembler`] rebuilds it
//! strictly in order, and [`FileTransfers`] ties both to a [`Multiplexer`].
//!
//! [`Multiplexer`]: crate::channels::Multiplexer

mod reassembly;
mod registry;
mod sender;

pub use reassembly::{ChunkOutcome, Reassembler};
pub use registry::{FileTransfers, TransferEvent};
pub use sender::FileSender;

use crate::channels::messages::FileMetadata;
use serde::Serialize;

/// MIME type used when the caller supplies none
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Lifecycle of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Chunks still flowing (in either direction)
    Uploading,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// Progress record of one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Unknown on the receiving side until the metadata or first chunk says
    pub total_chunks: Option<u64>,
    pub chunks_done: u64,
    /// Bytes sent or received so far; never decreases
    pub byte_count: u64,
    pub status: TransferStatus,
    pub direction: TransferDirection,
    /// Why the transfer ended in `Error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferRecord {
    fn new(metadata: &FileMetadata, direction: TransferDirection) -> Self {
        Self {
            id: metadata.id.clone(),
            name: metadata.name.clone(),
            size: metadata.size,
            mime_type: metadata.mime_type.clone(),
            total_chunks: metadata.total_chunks,
            chunks_done: 0,
            byte_count: 0,
            status: TransferStatus::Uploading,
            direction,
            error: None,
        }
    }

    /// Fraction of bytes done, in `0.0..=1.0`
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            return if self.status == TransferStatus::Completed { 1.0 } else { 0.0 };
        }
        self.byte_count as f64 / self.size as f64
    }

    pub fn is_finished(&self) -> bool {
        self.status != TransferStatus::Uploading
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.status = TransferStatus::Error;
        self.error = Some(reason.into());
    }
}

/// Number of chunks needed for `size` bytes
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size as u64)
}
