//! Sending side of a file transfer

use super::{chunk_count, TransferDirection, TransferRecord, TransferStatus};
use crate::channels::messages::{FileChunkHeader, FileMetadata};
use crate::channels::Multiplexer;
use crate::config::TransferConfig;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Slices a file into chunks and writes them through a [`Multiplexer`]
pub struct FileSender {
    mux: Arc<Multiplexer>,
    config: TransferConfig,
}

impl FileSender {
    pub fn new(mux: Arc<Multiplexer>, config: TransferConfig) -> Self {
        Self { mux, config }
    }

    /// Record for a transfer about to be sent
    pub fn prepare(&self, name: &str, mime_type: &str, size: u64) -> TransferRecord {
        let metadata = FileMetadata {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            size,
            mime_type: mime_type.to_string(),
            total_chunks: Some(chunk_count(size, self.config.chunk_size)),
        };
        TransferRecord::new(&metadata, TransferDirection::Sending)
    }

    /// Send `data` as the transfer `record` describes
    ///
    /// `on_progress` sees the record after every chunk but the last. The
    /// returned record is `Completed`, or `Error` with the reason if any write
    /// failed; nothing is retried.
    #[instrument(skip_all, fields(id = %record.id, size = record.size))]
    pub async fn send(
        &self,
        mut record: TransferRecord,
        data: &[u8],
        on_progress: impl Fn(&TransferRecord),
    ) -> TransferRecord {
        let total_chunks = chunk_count(data.len() as u64, self.config.chunk_size);
        let metadata = FileMetadata {
            id: record.id.clone(),
            name: record.name.clone(),
            size: data.len() as u64,
            mime_type: record.mime_type.clone(),
            total_chunks: Some(total_chunks),
        };
        record.size = metadata.size;
        record.total_chunks = metadata.total_chunks;

        if let Err(e) = self.mux.send_envelope(&metadata).await {
            warn!("Failed to announce transfer: {}", e);
            record.fail(format!("announcing transfer failed: {}", e));
            return record;
        }
        info!("Sending '{}' in {} chunks", record.name, total_chunks);

        for (index, chunk) in data.chunks(self.config.chunk_size).enumerate() {
            let index = index as u64;
            let header = FileChunkHeader {
                id: record.id.clone(),
                chunk_index: index,
                total_chunks,
                is_last: index + 1 == total_chunks,
            };

            if let Err(e) = self.mux.send_chunk(&header, chunk).await {
                warn!("Chunk {} of {} failed: {}", index, total_chunks, e);
                record.fail(format!("sending chunk {} failed: {}", index, e));
                return record;
            }
            record.chunks_done += 1;
            record.byte_count += chunk.len() as u64;

            if !header.is_last {
                on_progress(&record);
                // Yield so other senders and the channel's buffer can drain
                tokio::time::sleep(self.config.inter_chunk_delay()).await;
            }
        }

        record.status = TransferStatus::Completed;
        debug!("Transfer {} sent", record.id);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{channel_pair, ChannelEvent, Frame, FrameChannel};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_sends_metadata_then_header_binary_pairs() {
        let (local, remote) = channel_pair("messages");
        local.open();
        remote.open();
        let (tx, mut rx) = mpsc::unbounded_channel();
        remote.subscribe(tx);

        let mux = Multiplexer::new();
        mux.attach(local);
        let sender = FileSender::new(
            mux,
            TransferConfig {
                chunk_size: 4,
                inter_chunk_delay_ms: 0,
            },
        );

        let record = sender.prepare("a.txt", "text/plain", 10);
        assert_eq!(record.total_chunks, Some(3));
        let record = sender.send(record, b"0123456789", |_| {}).await;
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.byte_count, 10);

        let mut frames = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ChannelEvent::Frame(frame) = event {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 1 + 3 * 2);
        assert!(matches!(&frames[0], Frame::Text(t) if t.contains("file-metadata")));
        assert!(matches!(&frames[1], Frame::Text(t) if t.contains("\"chunkIndex\":0")));
        assert_eq!(frames[6], Frame::Binary(bytes::Bytes::from_static(b"89")));
    }

    #[tokio::test]
    async fn test_closed_channel_marks_error() {
        let sender = FileSender::new(Multiplexer::new(), TransferConfig::default());
        let record = sender.prepare("a.bin", "application/octet-stream", 3);
        let record = sender.send(record, b"abc", |_| {}).await;
        assert_eq!(record.status, TransferStatus::Error);
        assert!(record.error.is_some());
    }
}
