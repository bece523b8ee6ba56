use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::MAX_MESSAGE_BYTES;

// ── Event kinds ──────────────────────────────────────────────────────────────

/// Closed set of event kinds the bus will carry. Anything else is rejected
/// at ingress before a publish is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "favorite.added")]
    FavoriteAdded,
    #[serde(rename = "favorite.removed")]
    FavoriteRemoved,
    #[serde(rename = "playlist.created")]
    PlaylistCreated,
    #[serde(rename = "playlist.updated")]
    PlaylistUpdated,
    #[serde(rename = "playlist.deleted")]
    PlaylistDeleted,
    #[serde(rename = "playlist.song.added")]
    PlaylistSongAdded,
    #[serde(rename = "playlist.song.removed")]
    PlaylistSongRemoved,
    #[serde(rename = "history.added")]
    HistoryAdded,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FavoriteAdded => "favorite.added",
            Self::FavoriteRemoved => "favorite.removed",
            Self::PlaylistCreated => "playlist.created",
            Self::PlaylistUpdated => "playlist.updated",
            Self::PlaylistDeleted => "playlist.deleted",
            Self::PlaylistSongAdded => "playlist.song.added",
            Self::PlaylistSongRemoved => "playlist.song.removed",
            Self::HistoryAdded => "history.added",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Parse a wire string; `None` for anything outside the closed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "favorite.added" => Some(Self::FavoriteAdded),
            "favorite.removed" => Some(Self::FavoriteRemoved),
            "playlist.created" => Some(Self::PlaylistCreated),
            "playlist.updated" => Some(Self::PlaylistUpdated),
            "playlist.deleted" => Some(Self::PlaylistDeleted),
            "playlist.song.added" => Some(Self::PlaylistSongAdded),
            "playlist.song.removed" => Some(Self::PlaylistSongRemoved),
            "history.added" => Some(Self::HistoryAdded),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            _ => None,
        }
    }

    /// Liveness control kinds exchanged inside the application stream.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── SyncMessage ──────────────────────────────────────────────────────────────

/// The unit of fan-out: one user-scoped (or broadcast) event.
///
/// Unknown fields are tolerated on ingest for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Globally unique per event; stamped by the manager when absent.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Target recipient; empty only on a global broadcast.
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Milliseconds since the Unix epoch at origin.
    #[serde(default)]
    pub timestamp: i64,
    /// Present only when the message was drawn from the offline queue.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ack_token: String,
    /// Originating node; drives the subscriber's self-origin filter.
    #[serde(default)]
    pub instance_id: String,
}

impl SyncMessage {
    pub fn new(kind: EventKind, user_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: String::new(),
            kind,
            user_id: user_id.into(),
            data,
            timestamp: 0,
            ack_token: String::new(),
            instance_id: String::new(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Malformed)
    }

    /// Decode a frame from a client or the ingress API.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        if raw.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::Oversized { len: raw.len() });
        }
        serde_json::from_str(raw).map_err(ProtocolError::Malformed)
    }

    /// Decode a pub/sub payload. The `instance_id` field is mandatory on the
    /// fabric: a payload without it cannot be loop-filtered and is rejected.
    pub fn decode_fabric(raw: &str) -> Result<Self, ProtocolError> {
        let msg = Self::decode(raw)?;
        if msg.instance_id.is_empty() {
            return Err(ProtocolError::MissingInstanceId);
        }
        Ok(msg)
    }
}

// ── Ack requests ─────────────────────────────────────────────────────────────

/// One `(message id, ack token)` pair presented for removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckEntry {
    pub message_id: String,
    pub ack_token: String,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds the {MAX_MESSAGE_BYTES} byte limit")]
    Oversized { len: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("fabric payload missing instance_id")]
    MissingInstanceId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn wire_field_names_are_stable() {
        let mut msg = SyncMessage::new(
            EventKind::FavoriteAdded,
            "u1",
            data(&[("item_id", json!("s1"))]),
        );
        msg.id = "m1".into();
        msg.timestamp = 1234;
        msg.instance_id = "node-a".into();

        let encoded = msg.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["id"], "m1");
        assert_eq!(value["type"], "favorite.added");
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["data"]["item_id"], "s1");
        assert_eq!(value["timestamp"], 1234);
        assert_eq!(value["instance_id"], "node-a");
    }

    #[test]
    fn empty_ack_token_is_omitted() {
        let msg = SyncMessage::new(EventKind::Ping, "", Map::new());
        let encoded = msg.encode().unwrap();
        assert!(!encoded.contains("ack_token"));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let raw = r#"{"type":"history.added","user_id":"u1","data":{},"future_field":42}"#;
        let msg = SyncMessage::decode(raw).unwrap();
        assert_eq!(msg.kind, EventKind::HistoryAdded);
        assert_eq!(msg.user_id, "u1");
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"garbage","user_id":"u1","data":{}}"#;
        assert!(matches!(
            SyncMessage::decode(raw),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_parsing() {
        let raw = format!(
            r#"{{"type":"ping","data":{{"pad":"{}"}}}}"#,
            "x".repeat(MAX_MESSAGE_BYTES)
        );
        assert!(matches!(
            SyncMessage::decode(&raw),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn fabric_decode_requires_instance_id() {
        let raw = r#"{"type":"favorite.added","user_id":"u1","data":{}}"#;
        assert!(matches!(
            SyncMessage::decode_fabric(raw),
            Err(ProtocolError::MissingInstanceId)
        ));

        let raw = r#"{"type":"favorite.added","user_id":"u1","data":{},"instance_id":"n1"}"#;
        assert_eq!(SyncMessage::decode_fabric(raw).unwrap().instance_id, "n1");
    }

    #[test]
    fn event_kind_round_trips() {
        for kind in [
            EventKind::FavoriteAdded,
            EventKind::FavoriteRemoved,
            EventKind::PlaylistCreated,
            EventKind::PlaylistUpdated,
            EventKind::PlaylistDeleted,
            EventKind::PlaylistSongAdded,
            EventKind::PlaylistSongRemoved,
            EventKind::HistoryAdded,
            EventKind::Ping,
            EventKind::Pong,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("favorite.starred"), None);
    }

    #[test]
    fn control_kinds() {
        assert!(EventKind::Ping.is_control());
        assert!(EventKind::Pong.is_control());
        assert!(!EventKind::HistoryAdded.is_control());
    }
}
