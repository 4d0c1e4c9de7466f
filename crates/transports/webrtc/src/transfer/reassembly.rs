//! Strict in-order reassembly of received files

use super::{TransferDirection, TransferRecord, TransferStatus};
use crate::channels::messages::{FileChunkHeader, FileMetadata};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Result of feeding one chunk to the [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Appended; more expected
    Progress(TransferRecord),
    /// Appended; the transfer is complete
    Completed(TransferRecord),
    /// The chunk broke the transfer
    Failed(TransferRecord),
    /// Duplicate, unknown transfer, or transfer already finished
    Ignored,
}

struct Incoming {
    record: TransferRecord,
    chunks: Vec<Bytes>,
}

/// Rebuilds files from `file-metadata` plus paired `file-chunk` frames
///
/// Chunks must arrive in index order. A repeated index is ignored, a skipped
/// index fails the transfer, and completion requires exactly `size` bytes with
/// the final chunk flagged `isLast`.
#[derive(Default)]
pub struct Reassembler {
    transfers: HashMap<String, Incoming>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin receiving the transfer `metadata` announces
    ///
    /// A zero-byte file is complete immediately. Metadata reusing the id of an
    /// existing transfer replaces it.
    pub fn start(&mut self, metadata: &FileMetadata) -> TransferRecord {
        let mut record = TransferRecord::new(metadata, TransferDirection::Receiving);
        if metadata.size == 0 {
            record.status = TransferStatus::Completed;
        }

        let replaced = self.transfers.insert(
            metadata.id.clone(),
            Incoming {
                record: record.clone(),
                chunks: Vec::new(),
            },
        );
        if replaced.is_some() {
            warn!("Transfer {} restarted by new metadata", metadata.id);
        }
        record
    }

    /// Feed one chunk
    pub fn accept(&mut self, header: &FileChunkHeader, data: Bytes) -> ChunkOutcome {
        let Some(incoming) = self.transfers.get_mut(&header.id) else {
            warn!("Dropping chunk {} of unknown transfer {}", header.chunk_index, header.id);
            return ChunkOutcome::Ignored;
        };
        let record = &mut incoming.record;

        if record.status != TransferStatus::Uploading {
            debug!("Ignoring chunk {} of finished transfer {}", header.chunk_index, header.id);
            return ChunkOutcome::Ignored;
        }

        let expected = incoming.chunks.len() as u64;
        if header.chunk_index < expected {
            debug!("Ignoring duplicate chunk {} of {}", header.chunk_index, header.id);
            return ChunkOutcome::Ignored;
        }

        if let Some(reason) = Self::check(record, expected, header, data.len()) {
            warn!("Transfer {} failed: {}", header.id, reason);
            record.fail(reason);
            incoming.chunks.clear();
            return ChunkOutcome::Failed(record.clone());
        }

        record.total_chunks = Some(header.total_chunks);
        record.byte_count += data.len() as u64;
        record.chunks_done += 1;
        incoming.chunks.push(data);

        if header.is_last {
            record.status = TransferStatus::Completed;
            debug!("Transfer {} complete ({} bytes)", record.id, record.byte_count);
            ChunkOutcome::Completed(record.clone())
        } else {
            ChunkOutcome::Progress(record.clone())
        }
    }

    /// Why `header` cannot be appended, if it cannot
    fn check(
        record: &TransferRecord,
        expected: u64,
        header: &FileChunkHeader,
        len: usize,
    ) -> Option<String> {
        if header.chunk_index > expected {
            return Some(format!(
                "chunk {} arrived while expecting chunk {}",
                header.chunk_index, expected
            ));
        }
        if let Some(total) = record.total_chunks {
            if total != header.total_chunks {
                return Some(format!(
                    "chunk claims {} chunks, transfer announced {}",
                    header.total_chunks, total
                ));
            }
        }
        if header.chunk_index >= header.total_chunks {
            return Some(format!(
                "chunk index {} out of range for {} chunks",
                header.chunk_index, header.total_chunks
            ));
        }

        let byte_count = record.byte_count + len as u64;
        if byte_count > record.size {
            return Some(format!(
                "received {} bytes, more than the announced {}",
                byte_count, record.size
            ));
        }

        let complete = byte_count == record.size;
        if header.is_last && !complete {
            return Some(format!(
                "last chunk leaves {} of {} bytes",
                byte_count, record.size
            ));
        }
        if complete && !header.is_last {
            return Some(format!(
                "all {} bytes received before the last chunk",
                record.size
            ));
        }
        None
    }

    /// Current record of a transfer
    pub fn record(&self, id: &str) -> Option<TransferRecord> {
        self.transfers.get(id).map(|incoming| incoming.record.clone())
    }

    /// Remove a completed transfer and return its bytes
    ///
    /// Transfers still in progress are left alone; failed ones are discarded.
    pub fn take(&mut self, id: &str) -> Option<Bytes> {
        match self.transfers.get(id)?.record.status {
            TransferStatus::Uploading => None,
            TransferStatus::Error => {
                self.transfers.remove(id);
                None
            }
            TransferStatus::Completed => {
                let incoming = self.transfers.remove(id)?;
                let mut buffer = BytesMut::with_capacity(incoming.record.size as usize);
                for chunk in incoming.chunks {
                    buffer.extend_from_slice(&chunk);
                }
                Some(buffer.freeze())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(size: u64, total_chunks: Option<u64>) -> FileMetadata {
        FileMetadata {
            id: "t1".to_string(),
            name: "notes.txt".to_string(),
            size,
            mime_type: "text/plain".to_string(),
            total_chunks,
        }
    }

    fn header(index: u64, total: u64) -> FileChunkHeader {
        FileChunkHeader {
            id: "t1".to_string(),
            chunk_index: index,
            total_chunks: total,
            is_last: index + 1 == total,
        }
    }

    #[test]
    fn test_in_order_reassembly() {
        let mut reassembler = Reassembler::new();
        reassembler.start(&metadata(10, Some(3)));

        assert!(matches!(
            reassembler.accept(&header(0, 3), Bytes::from_static(b"abcd")),
            ChunkOutcome::Progress(_)
        ));
        assert!(matches!(
            reassembler.accept(&header(1, 3), Bytes::from_static(b"efgh")),
            ChunkOutcome::Progress(_)
        ));
        let done = match reassembler.accept(&header(2, 3), Bytes::from_static(b"ij")) {
            ChunkOutcome::Completed(record) => record,
            other => panic!("expected completion, got {:?}", other),
        };
        assert_eq!(done.byte_count, 10);
        assert_eq!(done.chunks_done, 3);

        assert_eq!(reassembler.take("t1").unwrap(), Bytes::from_static(b"abcdefghij"));
        assert!(reassembler.record("t1").is_none());
    }

    #[test]
    fn test_duplicate_chunk_ignored() {
        let mut reassembler = Reassembler::new();
        reassembler.start(&metadata(8, Some(2)));
        reassembler.accept(&header(0, 2), Bytes::from_static(b"abcd"));

        assert_eq!(
            reassembler.accept(&header(0, 2), Bytes::from_static(b"abcd")),
            ChunkOutcome::Ignored
        );
        assert!(matches!(
            reassembler.accept(&header(1, 2), Bytes::from_static(b"efgh")),
            ChunkOutcome::Completed(_)
        ));
    }

    #[test]
    fn test_gap_fails_transfer() {
        let mut reassembler = Reassembler::new();
        reassembler.start(&metadata(12, Some(3)));
        reassembler.accept(&header(0, 3), Bytes::from_static(b"abcd"));

        let failed = match reassembler.accept(&header(2, 3), Bytes::from_static(b"ijkl")) {
            ChunkOutcome::Failed(record) => record,
            other => panic!("expected failure, got {:?}", other),
        };
        assert_eq!(failed.status, TransferStatus::Error);
        assert_eq!(failed.byte_count, 4);

        // Finished transfers take no more chunks
        assert_eq!(
            reassembler.accept(&header(1, 3), Bytes::from_static(b"efgh")),
            ChunkOutcome::Ignored
        );
        assert!(reassembler.take("t1").is_none());
    }

    #[test]
    fn test_size_mismatches_fail() {
        let mut reassembler = Reassembler::new();
        reassembler.start(&metadata(5, None));
        assert!(matches!(
            reassembler.accept(&header(0, 1), Bytes::from_static(b"abc")),
            ChunkOutcome::Failed(_)
        ));

        let mut reassembler = Reassembler::new();
        reassembler.start(&metadata(3, None));
        assert!(matches!(
            reassembler.accept(&header(0, 2), Bytes::from_static(b"abcdef")),
            ChunkOutcome::Failed(_)
        ));

        let mut reassembler = Reassembler::new();
        reassembler.start(&metadata(4, None));
        assert!(matches!(
            reassembler.accept(&header(0, 2), Bytes::from_static(b"abcd")),
            ChunkOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_total_chunks_must_match_metadata() {
        let mut reassembler = Reassembler::new();
        reassembler.start(&metadata(8, Some(2)));
        assert!(matches!(
            reassembler.accept(&header(0, 3), Bytes::from_static(b"abc")),
            ChunkOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_unknown_transfer_and_empty_file() {
        let mut reassembler = Reassembler::new();
        assert_eq!(
            reassembler.accept(&header(0, 1), Bytes::from_static(b"x")),
            ChunkOutcome::Ignored
        );

        let record = reassembler.start(&metadata(0, Some(0)));
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(reassembler.take("t1").unwrap().len(), 0);
    }
}
