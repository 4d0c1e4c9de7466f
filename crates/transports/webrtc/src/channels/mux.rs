//! Kind-tagged envelope multiplexer over one data channel
//!
//! Outbound, every envelope goes through a single writer lock so that a file
//! chunk header and its binary frame are never split by another send.
//! Inbound, JSON frames are dispatched to the handlers registered for their
//! kind; binary frames are paired with the most recent `file-chunk` header and
//! handed to the chunk sink.

use super::messages::{kind_of, kinds, EnvelopeKind, FileChunkHeader, KIND_FIELD};
use super::{ChannelEvent, DataChannelStats, Frame, FrameChannel, MAX_MESSAGE_SIZE};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Envelope handler; receives the whole envelope including its `type` field
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Receiver of paired file chunks
pub type ChunkSink = Arc<dyn Fn(FileChunkHeader, Bytes) + Send + Sync>;

/// Registration handle returned by [`Multiplexer::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Attached {
    channel: Arc<dyn FrameChannel>,
    pump: JoinHandle<()>,
}

/// Multiplexes sub-protocols over one data channel
pub struct Multiplexer {
    attached: RwLock<Option<Arc<dyn FrameChannel>>>,
    pump: Mutex<Option<Attached>>,
    /// Held for the whole of each logical send
    write_lock: tokio::sync::Mutex<()>,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_handler_id: AtomicU64,
    pending_chunk: Mutex<Option<FileChunkHeader>>,
    chunk_sink: RwLock<Option<ChunkSink>>,
    open_tx: watch::Sender<bool>,
}

impl Default for Multiplexer {
    fn default() -> Self {
        let (open_tx, _) = watch::channel(false);
        Self {
            attached: RwLock::new(None),
            pump: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            handlers: RwLock::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            pending_chunk: Mutex::new(None),
            chunk_sink: RwLock::new(None),
            open_tx,
        }
    }
}

impl Multiplexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ========== Channel attachment ==========

    /// Install `channel` and start feeding its frames into [`Self::on_frame`]
    ///
    /// Any previously attached channel is detached first. When the channel
    /// reports closed it is detached automatically.
    pub fn attach(self: &Arc<Self>, channel: Arc<dyn FrameChannel>) {
        self.detach();

        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(tx);
        *self.attached.write() = Some(Arc::clone(&channel));
        self.open_tx.send_replace(channel.is_open());

        info!("Multiplexer attached to channel '{}'", channel.label());

        let weak = Arc::downgrade(self);
        let pumped = Arc::clone(&channel);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(mux) = weak.upgrade() else { break };
                match event {
                    ChannelEvent::Open => {
                        debug!("Channel '{}' open", pumped.label());
                        mux.open_tx.send_replace(true);
                    }
                    ChannelEvent::Frame(frame) => mux.on_frame(frame),
                    ChannelEvent::Closed => {
                        info!("Channel '{}' closed, detaching", pumped.label());
                        mux.release(&pumped);
                        break;
                    }
                }
            }
        });

        *self.pump.lock() = Some(Attached { channel, pump });
    }

    /// Remove the attached channel, if any, without closing it
    pub fn detach(&self) -> Option<Arc<dyn FrameChannel>> {
        let attached = self.pump.lock().take();
        let channel = self.attached.write().take();
        *self.pending_chunk.lock() = None;
        self.open_tx.send_replace(false);

        if let Some(attached) = attached {
            attached.pump.abort();
        }
        channel
    }

    /// Detach only if `channel` is still the attached one
    fn release(&self, channel: &Arc<dyn FrameChannel>) {
        let mut pump = self.pump.lock();
        let is_current = pump
            .as_ref()
            .map(|attached| Arc::ptr_eq(&attached.channel, channel))
            .unwrap_or(false);
        if !is_current {
            return;
        }

        pump.take();
        *self.attached.write() = None;
        *self.pending_chunk.lock() = None;
        self.open_tx.send_replace(false);
    }

    /// Currently attached channel
    pub fn channel(&self) -> Option<Arc<dyn FrameChannel>> {
        self.attached.read().clone()
    }

    /// Whether a channel is attached and open
    pub fn is_open(&self) -> bool {
        self.attached
            .read()
            .as_ref()
            .map(|channel| channel.is_open())
            .unwrap_or(false)
    }

    /// Watch the open state of the attached channel
    pub fn watch_open(&self) -> watch::Receiver<bool> {
        self.open_tx.subscribe()
    }

    /// Traffic counters of the attached channel
    pub fn stats(&self) -> Option<DataChannelStats> {
        self.attached.read().as_ref().map(|channel| channel.stats())
    }

    // ========== Outbound ==========

    /// Send one envelope of `kind` with the given fields
    ///
    /// `fields` must be a JSON object (or null for a bare envelope); its
    /// `type` field, if any, is replaced by `kind`.
    pub async fn send(&self, kind: &str, fields: Value) -> Result<()> {
        let text = encode_envelope(kind, fields)?;

        let _writer = self.write_lock.lock().await;
        let channel = self.open_channel(kind)?;
        channel.send_text(&text).await
    }

    /// Send a typed envelope
    pub async fn send_envelope<T: EnvelopeKind>(&self, payload: &T) -> Result<()> {
        self.send(T::KIND, serde_json::to_value(payload)?).await
    }

    /// Send an envelope immediately followed by a binary frame
    ///
    /// Both writes happen under the writer lock; no other send can land
    /// between them.
    pub async fn send_with_binary(&self, kind: &str, fields: Value, data: &[u8]) -> Result<()> {
        let text = encode_envelope(kind, fields)?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "Binary frame of {} bytes exceeds maximum {} bytes",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let _writer = self.write_lock.lock().await;
        let channel = self.open_channel(kind)?;
        channel.send_text(&text).await?;
        channel.send_binary(data).await
    }

    /// Send a file chunk header and its bytes as one unit
    pub async fn send_chunk(&self, header: &FileChunkHeader, data: &[u8]) -> Result<()> {
        self.send_with_binary(FileChunkHeader::KIND, serde_json::to_value(header)?, data)
            .await
    }

    fn open_channel(&self, kind: &str) -> Result<Arc<dyn FrameChannel>> {
        match self.attached.read().as_ref() {
            Some(channel) if channel.is_open() => Ok(Arc::clone(channel)),
            _ => {
                debug!("Dropping '{}' envelope: no open channel", kind);
                Err(Error::ChannelNotOpen)
            }
        }
    }

    // ========== Inbound ==========

    /// Register a handler for `kind`; several handlers may share a kind
    pub fn subscribe<F>(&self, kind: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Register a handler that receives envelopes of `T`'s kind already decoded
    pub fn subscribe_to<T, F>(&self, handler: F) -> HandlerId
    where
        T: EnvelopeKind,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(T::KIND, move |envelope| {
            match serde_json::from_value::<T>(envelope.clone()) {
                Ok(payload) => handler(payload),
                Err(e) => warn!("Dropping malformed '{}' envelope: {}", T::KIND, e),
            }
        })
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(handler_id, _)| *handler_id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Number of handlers registered for `kind`
    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers.read().get(kind).map(Vec::len).unwrap_or(0)
    }

    /// Install the receiver of paired file chunks, replacing any previous one
    pub fn on_chunk<F>(&self, sink: F)
    where
        F: Fn(FileChunkHeader, Bytes) + Send + Sync + 'static,
    {
        *self.chunk_sink.write() = Some(Arc::new(sink));
    }

    /// Dispatch one inbound frame
    pub fn on_frame(&self, frame: Frame) {
        match frame {
            Frame::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(envelope) => self.dispatch(envelope),
                Err(_) => self.route_binary(Bytes::from(text.into_bytes())),
            },
            Frame::Binary(data) => self.route_binary(data),
        }
    }

    fn dispatch(&self, envelope: Value) {
        let Some(kind) = kind_of(&envelope).map(str::to_string) else {
            warn!("Dropping envelope without a '{}' field", KIND_FIELD);
            return;
        };

        let mut consumed = false;
        if kind == kinds::FILE_CHUNK {
            match serde_json::from_value::<FileChunkHeader>(envelope.clone()) {
                Ok(header) => {
                    if let Some(stale) = self.pending_chunk.lock().replace(header) {
                        warn!(
                            "Chunk header {}#{} superseded before its data arrived",
                            stale.id, stale.chunk_index
                        );
                    }
                    consumed = self.chunk_sink.read().is_some();
                }
                Err(e) => warn!("Dropping malformed chunk header: {}", e),
            }
        }

        // Clone out so handlers may (un)subscribe while running
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            if !consumed {
                debug!("No handler for '{}' envelope, dropping", kind);
            }
            return;
        }

        for handler in handlers {
            handler(&envelope);
        }
    }

    fn route_binary(&self, data: Bytes) {
        let Some(header) = self.pending_chunk.lock().take() else {
            warn!("Dropping {}-byte binary frame with no pending chunk header", data.len());
            return;
        };

        let sink = self.chunk_sink.read().clone();
        match sink {
            Some(sink) => sink(header, data),
            None => warn!("No chunk sink installed, dropping chunk {}#{}", header.id, header.chunk_index),
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Some(attached) = self.pump.get_mut().take() {
            attached.pump.abort();
        }
    }
}

fn encode_envelope(kind: &str, fields: Value) -> Result<String> {
    let mut object = match fields {
        Value::Object(object) => object,
        Value::Null => Map::new(),
        other => {
            return Err(Error::DataChannelError(format!(
                "Envelope fields must be a JSON object, got {}",
                other
            )))
        }
    };
    object.insert(KIND_FIELD.to_string(), Value::String(kind.to_string()));

    let text = serde_json::to_string(&Value::Object(object))?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(Error::DataChannelError(format!(
            "Envelope of {} bytes exceeds maximum {} bytes",
            text.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::channel_pair;
    use crate::channels::messages::{ChatMessage, GameMove};
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    async fn open_pair() -> (Arc<Multiplexer>, Arc<Multiplexer>) {
        let (a, b) = channel_pair("messages");
        a.open();
        b.open();
        let left = Multiplexer::new();
        let right = Multiplexer::new();
        left.attach(a);
        right.attach(b);
        (left, right)
    }

    #[tokio::test]
    async fn test_send_without_channel() {
        let mux = Multiplexer::new();
        let err = assert_err!(mux.send("message", json!({"text": "hi"})).await);
        assert!(matches!(err, Error::ChannelNotOpen));
    }

    #[tokio::test]
    async fn test_dispatch_by_kind() {
        let (left, right) = open_pair().await;
        let (chat_tx, mut chat_rx) = mpsc::unbounded_channel();
        let (game_tx, mut game_rx) = mpsc::unbounded_channel();

        right.subscribe("message", move |v| {
            let _ = chat_tx.send(v.clone());
        });
        right.subscribe("game-move", move |v| {
            let _ = game_tx.send(v.clone());
        });

        assert_ok!(left.send("message", json!({"text": "hi"})).await);
        assert_ok!(
            left.send("game-move", json!({"game": "ttt", "move": 1, "state": []}))
                .await
        );
        assert_ok!(left.send("message", json!({"text": "again"})).await);

        assert_eq!(chat_rx.recv().await.unwrap(), json!({"type": "message", "text": "hi"}));
        assert_eq!(chat_rx.recv().await.unwrap()["text"], "again");
        assert_eq!(game_rx.recv().await.unwrap()["game"], "ttt");
        assert!(chat_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        let (left, right) = open_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        right.subscribe_to(move |chat: ChatMessage| {
            let _ = tx.send(chat);
        });

        left.send_envelope(&ChatMessage::emoji(":)")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ChatMessage::emoji(":)"));
    }

    #[tokio::test]
    async fn test_multiple_handlers_and_unsubscribe() {
        let mux = Multiplexer::new();
        let hits = Arc::new(AtomicU64::new(0));

        let h1 = Arc::clone(&hits);
        let first = mux.subscribe("love-note", move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = Arc::clone(&hits);
        mux.subscribe("love-note", move |_| {
            h2.fetch_add(10, Ordering::SeqCst);
        });

        mux.on_frame(Frame::Text(r#"{"type":"love-note","text":"x"}"#.to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert!(mux.unsubscribe(first));
        assert!(!mux.unsubscribe(first));
        mux.on_frame(Frame::Text(r#"{"type":"love-note","text":"x"}"#.to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 21);
        assert_eq!(mux.handler_count("love-note"), 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_and_garbage_are_dropped() {
        let mux = Multiplexer::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        mux.subscribe_to(move |_: GameMove| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        mux.on_frame(Frame::Text(r#"{"type":"unknown"}"#.to_string()));
        mux.on_frame(Frame::Text(r#"{"no":"kind"}"#.to_string()));
        mux.on_frame(Frame::Text(r#"{"type":"game-move"}"#.to_string()));
        mux.on_frame(Frame::Binary(Bytes::from_static(b"orphan")));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chunk_pairing() {
        let (left, right) = open_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        right.on_chunk(move |header, data| {
            let _ = tx.send((header, data));
        });

        let header = FileChunkHeader {
            id: "f1".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            is_last: true,
        };
        left.send_chunk(&header, b"payload").await.unwrap();

        let (got, data) = rx.recv().await.unwrap();
        assert_eq!(got, header);
        assert_eq!(&data[..], b"payload");
    }

    #[tokio::test]
    async fn test_concurrent_chunks_never_interleave() {
        let (left, right) = open_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        right.on_chunk(move |header, data| {
            let _ = tx.send((header, data));
        });

        let mut tasks = Vec::new();
        for sender in 0..4u8 {
            let left = Arc::clone(&left);
            tasks.push(tokio::spawn(async move {
                for index in 0..8u64 {
                    let header = FileChunkHeader {
                        id: format!("f{}", sender),
                        chunk_index: index,
                        total_chunks: 8,
                        is_last: index == 7,
                    };
                    left.send_chunk(&header, &[sender; 32]).await.unwrap();
                    left.send("message", json!({"text": "chatter"})).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for _ in 0..32 {
            let (header, data) = rx.recv().await.unwrap();
            let sender = header.id[1..].parse::<u8>().unwrap();
            assert!(data.iter().all(|b| *b == sender));
        }
    }

    #[tokio::test]
    async fn test_close_detaches() {
        let (left, right) = open_pair().await;
        let mut open = right.watch_open();
        assert!(right.is_open());

        left.channel().unwrap().close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), open.wait_for(|open| !*open))
            .await
            .unwrap()
            .unwrap();
        assert!(right.channel().is_none());
        assert!(matches!(
            right.send("message", json!({})).await,
            Err(Error::ChannelNotOpen)
        ));
    }

    #[test]
    fn test_encode_envelope_sets_kind() {
        let text = encode_envelope("love-note", json!({"type": "spoofed", "text": "x"})).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "love-note");
        assert!(encode_envelope("message", json!([1, 2])).is_err());
    }
}
