use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{EventKind, SyncMessage};

/// A queued, not-yet-delivered event with its acknowledgement coupon.
///
/// The `(id, ack_token)` pair is the removal key: a client cannot ack a
/// message by guessing its id alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMessage {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// 128-bit random hex, minted at push time.
    pub ack_token: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub expires_at: i64,
}

impl OfflineMessage {
    /// Deliverable iff `expires_at > now`.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis >= self.expires_at
    }

    /// Shape for delivery to a live connection; the ack coupon travels with
    /// the message so the client can acknowledge it.
    pub fn to_sync_message(&self) -> SyncMessage {
        SyncMessage {
            id: self.id.clone(),
            kind: self.kind,
            user_id: self.user_id.clone(),
            data: self.data.clone(),
            timestamp: self.created_at,
            ack_token: self.ack_token.clone(),
            instance_id: String::new(),
        }
    }
}
