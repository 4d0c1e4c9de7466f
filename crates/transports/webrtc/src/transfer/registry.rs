//! File transfer sub-protocol bound to a multiplexer

use super::{
    ChunkOutcome, FileSender, Reassembler, TransferDirection, TransferRecord, TransferStatus,
    DEFAULT_MIME_TYPE,
};
use crate::channels::messages::{FileChunkHeader, FileMetadata};
use crate::channels::{HandlerId, Multiplexer};
use crate::config::TransferConfig;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Capacity of the transfer event channel
const EVENT_CAPACITY: usize = 256;

/// Transfer lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started(TransferRecord),
    Progress(TransferRecord),
    Completed(TransferRecord),
    Failed(TransferRecord),
}

impl TransferEvent {
    pub fn record(&self) -> &TransferRecord {
        match self {
            TransferEvent::Started(r)
            | TransferEvent::Progress(r)
            | TransferEvent::Completed(r)
            | TransferEvent::Failed(r) => r,
        }
    }
}

/// Both directions of file transfer on one multiplexer
pub struct FileTransfers {
    mux: Arc<Multiplexer>,
    sender: FileSender,
    records: RwLock<HashMap<String, TransferRecord>>,
    reassembler: Mutex<Reassembler>,
    events: broadcast::Sender<TransferEvent>,
    metadata_handler: Mutex<Option<HandlerId>>,
}

impl FileTransfers {
    /// Register the receiving side on `mux` and return the transfer table
    ///
    /// Takes over the multiplexer's chunk sink.
    pub fn install(mux: &Arc<Multiplexer>, config: TransferConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let transfers = Arc::new(Self {
            mux: Arc::clone(mux),
            sender: FileSender::new(Arc::clone(mux), config),
            records: RwLock::new(HashMap::new()),
            reassembler: Mutex::new(Reassembler::new()),
            events,
            metadata_handler: Mutex::new(None),
        });

        let weak = Arc::downgrade(&transfers);
        let handler = mux.subscribe_to::<FileMetadata, _>(move |metadata| {
            if let Some(transfers) = weak.upgrade() {
                transfers.on_metadata(metadata);
            }
        });
        *transfers.metadata_handler.lock() = Some(handler);

        let weak = Arc::downgrade(&transfers);
        mux.on_chunk(move |header, data| {
            if let Some(transfers) = weak.upgrade() {
                transfers.on_chunk(header, data);
            }
        });

        Ok(transfers)
    }

    /// Observe transfer events in both directions
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Send an in-memory file
    ///
    /// Returns the final record; a transfer that ended in `Error` is returned
    /// as [`Error::TransferError`].
    pub async fn send_bytes(&self, name: &str, mime_type: &str, data: Bytes) -> Result<TransferRecord> {
        let record = self.sender.prepare(name, mime_type, data.len() as u64);
        self.publish(TransferEvent::Started(record.clone()));

        let record = self
            .sender
            .send(record, &data, |progress| {
                self.publish(TransferEvent::Progress(progress.clone()))
            })
            .await;
        self.finish(record)
    }

    /// Send a file from disk; `mime_type` defaults to `application/octet-stream`
    pub async fn send_path(&self, path: impl AsRef<Path>, mime_type: Option<&str>) -> Result<TransferRecord> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mime_type = mime_type.unwrap_or(DEFAULT_MIME_TYPE);

        match tokio::fs::read(path).await {
            Ok(data) => self.send_bytes(&name, mime_type, Bytes::from(data)).await,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                let mut record = self.sender.prepare(&name, mime_type, 0);
                record.total_chunks = None;
                record.fail(format!("reading {} failed: {}", path.display(), e));
                self.finish(record)
            }
        }
    }

    fn finish(&self, record: TransferRecord) -> Result<TransferRecord> {
        match record.status {
            TransferStatus::Error => {
                let reason = record.error.clone().unwrap_or_default();
                self.publish(TransferEvent::Failed(record));
                Err(Error::TransferError(reason))
            }
            _ => {
                info!("Transfer {} ('{}') sent", record.id, record.name);
                self.publish(TransferEvent::Completed(record.clone()));
                Ok(record)
            }
        }
    }

    fn on_metadata(&self, metadata: FileMetadata) {
        if metadata.id.is_empty() {
            warn!("Ignoring file metadata without an id");
            return;
        }
        info!(
            "Receiving '{}' ({} bytes, {})",
            metadata.name, metadata.size, metadata.mime_type
        );
        let record = self.reassembler.lock().start(&metadata);
        self.publish(TransferEvent::Started(record.clone()));
        if record.status == TransferStatus::Completed {
            self.publish(TransferEvent::Completed(record));
        }
    }

    fn on_chunk(&self, header: FileChunkHeader, data: Bytes) {
        let outcome = self.reassembler.lock().accept(&header, data);
        match outcome {
            ChunkOutcome::Progress(record) => self.publish(TransferEvent::Progress(record)),
            ChunkOutcome::Completed(record) => {
                info!("Received '{}' ({} bytes)", record.name, record.byte_count);
                self.publish(TransferEvent::Completed(record));
            }
            ChunkOutcome::Failed(record) => self.publish(TransferEvent::Failed(record)),
            ChunkOutcome::Ignored => {}
        }
    }

    fn publish(&self, event: TransferEvent) {
        let record = event.record().clone();
        self.records.write().insert(record.id.clone(), record);
        let _ = self.events.send(event);
    }

    /// Latest record of a transfer in either direction
    pub fn record(&self, id: &str) -> Option<TransferRecord> {
        self.records.read().get(id).cloned()
    }

    /// All known transfers
    pub fn records(&self) -> Vec<TransferRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Records of one direction
    pub fn records_by(&self, direction: TransferDirection) -> Vec<TransferRecord> {
        self.records
            .read()
            .values()
            .filter(|r| r.direction == direction)
            .cloned()
            .collect()
    }

    /// Bytes of a completed incoming transfer; hands them out once
    pub fn take_received(&self, id: &str) -> Option<Bytes> {
        self.reassembler.lock().take(id)
    }
}

impl Drop for FileTransfers {
    fn drop(&mut self) {
        if let Some(handler) = self.metadata_handler.lock().take() {
            self.mux.unsubscribe(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::channel_pair;
    use std::io::Write;
    use tokio::time::{timeout, Duration};

    fn config() -> TransferConfig {
        TransferConfig {
            chunk_size: 1024,
            inter_chunk_delay_ms: 0,
        }
    }

    fn linked() -> (Arc<FileTransfers>, Arc<FileTransfers>) {
        let (a, b) = channel_pair("messages");
        a.open();
        b.open();
        let mux_a = Multiplexer::new();
        let mux_b = Multiplexer::new();
        mux_a.attach(a);
        mux_b.attach(b);
        (
            FileTransfers::install(&mux_a, config()).unwrap(),
            FileTransfers::install(&mux_b, config()).unwrap(),
        )
    }

    async fn wait_completed(rx: &mut broadcast::Receiver<TransferEvent>) -> TransferRecord {
        timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await.unwrap() {
                    TransferEvent::Completed(record) => return record,
                    TransferEvent::Failed(record) => panic!("transfer failed: {:?}", record.error),
                    _ => {}
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (sender, receiver) = linked();
        let mut events = receiver.subscribe();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let sent = sender
            .send_bytes("data.bin", "application/octet-stream", Bytes::from(data.clone()))
            .await
            .unwrap();
        assert_eq!(sent.total_chunks, Some(5));

        let received = wait_completed(&mut events).await;
        assert_eq!(received.id, sent.id);
        assert_eq!(received.byte_count, 5000);
        assert_eq!(received.direction, TransferDirection::Receiving);
        assert_eq!(receiver.take_received(&sent.id).unwrap(), Bytes::from(data));
        assert!(receiver.take_received(&sent.id).is_none());
        assert_eq!(sender.records_by(TransferDirection::Sending).len(), 1);
    }

    #[tokio::test]
    async fn test_zero_byte_file() {
        let (sender, receiver) = linked();
        let mut events = receiver.subscribe();

        let sent = sender.send_bytes("empty", "text/plain", Bytes::new()).await.unwrap();
        assert_eq!(sent.status, TransferStatus::Completed);

        let received = wait_completed(&mut events).await;
        assert_eq!(received.size, 0);
        assert_eq!(receiver.take_received(&sent.id).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_send_path() {
        let (sender, receiver) = linked();
        let mut events = receiver.subscribe();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello from disk").unwrap();

        let sent = sender.send_path(file.path(), Some("text/plain")).await.unwrap();
        let received = wait_completed(&mut events).await;
        assert_eq!(received.mime_type, "text/plain");
        assert_eq!(
            receiver.take_received(&sent.id).unwrap(),
            Bytes::from_static(b"hello from disk")
        );
    }

    #[tokio::test]
    async fn test_missing_path_fails() {
        let (sender, _receiver) = linked();
        let mut events = sender.subscribe();

        let err = sender
            .send_path("/definitely/not/here.bin", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferError(_)));
        match events.recv().await.unwrap() {
            TransferEvent::Failed(record) => assert_eq!(record.name, "here.bin"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_without_channel_fails() {
        let mux = Multiplexer::new();
        let transfers = FileTransfers::install(&mux, config()).unwrap();
        let err = transfers
            .send_bytes("a", "text/plain", Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransferError(_)));
        assert_eq!(transfers.records()[0].status, TransferStatus::Error);
    }
}
