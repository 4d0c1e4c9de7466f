//! Sub-protocol envelopes carried over the multiplexed channel
//!
//! Every JSON frame is an object whose `type` field names its kind; the other
//! fields belong to the sub-protocol. File chunk headers are followed on the
//! wire by one binary frame holding the chunk bytes.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field of every envelope that holds its kind
pub const KIND_FIELD: &str = "type";

/// Envelope kinds used by the built-in sub-protocols
pub mod kinds {
    pub const MESSAGE: &str = "message";
    pub const FILE_METADATA: &str = "file-metadata";
    pub const FILE_CHUNK: &str = "file-chunk";
    pub const GAME_MOVE: &str = "game-move";
    pub const VIDEO_CONTROL: &str = "video-control";
    pub const LOVE_NOTE: &str = "love-note";
    pub const SHARED_MOMENT: &str = "shared-moment";
}

/// A payload type bound to one envelope kind
pub trait EnvelopeKind: Serialize + DeserializeOwned + Send + 'static {
    /// Value of the `type` field
    const KIND: &'static str;
}

/// Kind of a parsed envelope, if it has one
pub fn kind_of(envelope: &Value) -> Option<&str> {
    envelope.get(KIND_FIELD).and_then(Value::as_str)
}

/// Chat message style
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageType {
    #[default]
    Text,
    Emoji,
    Love,
}

/// `message`: a chat line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    #[serde(rename = "messageType", default)]
    pub message_type: ChatMessageType,
}

impl ChatMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            message_type: ChatMessageType::Text,
        }
    }

    pub fn emoji(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            message_type: ChatMessageType::Emoji,
        }
    }

    pub fn love(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            message_type: ChatMessageType::Love,
        }
    }
}

impl EnvelopeKind for ChatMessage {
    const KIND: &'static str = kinds::MESSAGE;
}

/// `file-metadata`: announces a transfer before its first chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    /// Total size in bytes
    pub size: u64,
    #[serde(alias = "fileType")]
    pub mime_type: String,
    /// Number of chunks that follow; older senders omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u64>,
}

impl EnvelopeKind for FileMetadata {
    const KIND: &'static str = kinds::FILE_METADATA;
}

/// `file-chunk`: header for the binary frame that follows it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkHeader {
    pub id: String,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub is_last: bool,
}

impl EnvelopeKind for FileChunkHeader {
    const KIND: &'static str = kinds::FILE_CHUNK;
}

/// `game-move`: a move in a shared game plus the resulting state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMove {
    /// Game identifier, e.g. `tic-tac-toe`
    pub game: String,
    #[serde(rename = "move")]
    pub game_move: Value,
    pub state: Value,
}

impl EnvelopeKind for GameMove {
    const KIND: &'static str = kinds::GAME_MOVE;
}

/// Shared playback action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoAction {
    Play,
    Pause,
    Seek,
    Volume,
    Mute,
}

/// `video-control`: keeps both players in sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoControl {
    pub action: VideoAction,
    /// Seek position in seconds, volume in 0.0-1.0, or mute flag as 0/1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl VideoControl {
    pub fn new(action: VideoAction) -> Self {
        Self {
            action,
            value: None,
        }
    }

    pub fn with_value(action: VideoAction, value: f64) -> Self {
        Self {
            action,
            value: Some(value),
        }
    }
}

impl EnvelopeKind for VideoControl {
    const KIND: &'static str = kinds::VIDEO_CONTROL;
}

/// `love-note`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoveNote {
    pub text: String,
}

impl EnvelopeKind for LoveNote {
    const KIND: &'static str = kinds::LOVE_NOTE;
}

/// `shared-moment`: a dated memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMoment {
    pub title: String,
    pub description: String,
    pub date: DateTime<Utc>,
}

impl EnvelopeKind for SharedMoment {
    const KIND: &'static str = kinds::SHARED_MOMENT;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_default_type() {
        let chat: ChatMessage = serde_json::from_value(json!({"type": "message", "text": "hi"})).unwrap();
        assert_eq!(chat, ChatMessage::text("hi"));

        let value = serde_json::to_value(ChatMessage::love("<3")).unwrap();
        assert_eq!(value, json!({"text": "<3", "messageType": "love"}));
    }

    #[test]
    fn test_file_metadata_accepts_file_type_alias() {
        let meta: FileMetadata = serde_json::from_value(json!({
            "type": "file-metadata",
            "id": "f1",
            "name": "photo.jpg",
            "size": 40000,
            "fileType": "image/jpeg"
        }))
        .unwrap();
        assert_eq!(meta.mime_type, "image/jpeg");
        assert_eq!(meta.total_chunks, None);

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["mimeType"], "image/jpeg");
        assert!(value.get("totalChunks").is_none());
    }

    #[test]
    fn test_chunk_header_wire_names() {
        let header = FileChunkHeader {
            id: "f1".to_string(),
            chunk_index: 2,
            total_chunks: 3,
            is_last: true,
        };
        assert_eq!(
            serde_json::to_value(&header).unwrap(),
            json!({"id": "f1", "chunkIndex": 2, "totalChunks": 3, "isLast": true})
        );
    }

    #[test]
    fn test_game_move_uses_move_key() {
        let value = json!({"game": "tic-tac-toe", "move": {"cell": 4}, "state": ["X", null]});
        let game_move: GameMove = serde_json::from_value(value).unwrap();
        assert_eq!(game_move.game_move["cell"], 4);
    }

    #[test]
    fn test_video_control() {
        let control: VideoControl =
            serde_json::from_value(json!({"action": "seek", "value": 42.5})).unwrap();
        assert_eq!(control, VideoControl::with_value(VideoAction::Seek, 42.5));

        assert!(serde_json::from_value::<VideoControl>(json!({"action": "rewind"})).is_err());
    }

    #[test]
    fn test_shared_moment_date() {
        let moment: SharedMoment = serde_json::from_value(json!({
            "title": "First call",
            "description": "",
            "date": "2024-02-14T19:30:00.000Z"
        }))
        .unwrap();
        assert_eq!(moment.date.to_rfc3339(), "2024-02-14T19:30:00+00:00");
    }

    #[test]
    fn test_kind_of() {
        assert_eq!(kind_of(&json!({"type": "love-note", "text": "x"})), Some("love-note"));
        assert_eq!(kind_of(&json!({"text": "x"})), None);
        assert_eq!(kind_of(&json!({"type": 3})), None);
    }
}
