use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::QueueError;

use streamsync_broker::SequenceStore;
use streamsync_protocol::channel::{OFFLINE_QUEUE_PATTERN, offline_queue_key, user_from_queue_key};
use streamsync_protocol::{
    EventKind, MAX_QUEUE, OFFLINE_KEY_GRACE, OFFLINE_TTL, OfflineMessage, now_millis,
};

/// Aggregate queue counts for observability.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub queued_users: usize,
    pub queued_messages: u64,
}

pub struct OfflineQueue {
    store: Arc<dyn SequenceStore>,
    ttl: Duration,
    key_grace: Duration,
    max_queue: usize,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn SequenceStore>) -> Self {
        Self {
            store,
            ttl: OFFLINE_TTL,
            key_grace: OFFLINE_KEY_GRACE,
            max_queue: MAX_QUEUE,
        }
    }

    /// Override the message TTL (tests and operational tuning).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Queue one event for an offline user. Mints a fresh id and ack coupon,
    /// prepends, truncates to the depth bound keeping the newest, and
    /// refreshes the backing key's TTL, atomically per user.
    pub async fn push(
        &self,
        user_id: &str,
        kind: EventKind,
        data: Map<String, Value>,
    ) -> Result<OfflineMessage, QueueError> {
        let now = now_millis();
        let msg = OfflineMessage {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            data,
            ack_token: new_ack_token(),
            created_at: now,
            expires_at: now + self.ttl.as_millis() as i64,
        };
        let raw = serde_json::to_string(&msg)?;
        self.store
            .prepend_and_trim(
                &offline_queue_key(user_id),
                &raw,
                self.max_queue,
                self.ttl + self.key_grace,
            )
            .await?;
        debug!(user_id, message_id = %msg.id, kind = %msg.kind, "queued offline message");
        Ok(msg)
    }

    /// Newest-first prefix of at most `limit` unexpired messages. Expired
    /// entries are filtered out and removed best-effort.
    pub async fn pull(&self, user_id: &str, limit: usize) -> Result<Vec<OfflineMessage>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = offline_queue_key(user_id);
        let raw_entries = self.store.range(&key, 0, limit as isize - 1).await?;
        let now = now_millis();
        let mut live = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            match serde_json::from_str::<OfflineMessage>(&raw) {
                Ok(msg) if msg.is_expired(now) => self.discard(&key, &raw).await,
                Ok(msg) => live.push(msg),
                Err(e) => {
                    warn!(user_id, error = %e, "dropping undecodable offline entry");
                    self.discard(&key, &raw).await;
                },
            }
        }
        Ok(live)
    }

    /// Remove the entry matching `(id, ack_token)` exactly.
    pub async fn ack(&self, user_id: &str, id: &str, ack_token: &str) -> Result<(), QueueError> {
        let key = offline_queue_key(user_id);
        let raw_entries = self.store.range(&key, 0, -1).await?;
        for raw in raw_entries {
            let Ok(msg) = serde_json::from_str::<OfflineMessage>(&raw) else {
                continue;
            };
            if msg.id != id {
                continue;
            }
            if msg.ack_token != ack_token {
                return Err(QueueError::Auth);
            }
            self.store.remove(&key, &raw).await?;
            debug!(user_id, message_id = id, "acked offline message");
            return Ok(());
        }
        Err(QueueError::NotFound)
    }

    /// Process each pair and return the valid count. Succeeds iff at least
    /// one pair was valid; storage failures abort.
    pub async fn batch_ack(
        &self,
        user_id: &str,
        acks: &[(String, String)],
    ) -> Result<usize, QueueError> {
        let mut valid = 0;
        for (id, token) in acks {
            match self.ack(user_id, id, token).await {
                Ok(()) => valid += 1,
                Err(QueueError::Auth | QueueError::NotFound) => {},
                Err(e) => return Err(e),
            }
        }
        if valid == 0 {
            return Err(QueueError::NotFound);
        }
        Ok(valid)
    }

    pub async fn count(&self, user_id: &str) -> Result<u64, QueueError> {
        Ok(self.store.len(&offline_queue_key(user_id)).await?)
    }

    pub async fn clear(&self, user_id: &str) -> Result<(), QueueError> {
        Ok(self.store.delete(&offline_queue_key(user_id)).await?)
    }

    /// Global sweep removing expired entries from every queue. Best-effort
    /// and idempotent; `pull` filters defensively regardless.
    pub async fn cleanup_expired(&self) -> Result<u64, QueueError> {
        let keys = self.store.scan_keys(OFFLINE_QUEUE_PATTERN).await?;
        let now = now_millis();
        let mut removed = 0u64;
        for key in keys {
            let raw_entries = self.store.range(&key, 0, -1).await?;
            for raw in raw_entries {
                let expired = match serde_json::from_str::<OfflineMessage>(&raw) {
                    Ok(msg) => msg.is_expired(now),
                    Err(_) => true,
                };
                if expired {
                    removed += self.store.remove(&key, &raw).await.unwrap_or(0);
                }
            }
        }
        if removed > 0 {
            debug!(removed, "expired offline messages removed");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let keys = self.store.scan_keys(OFFLINE_QUEUE_PATTERN).await?;
        let mut stats = QueueStats {
            queued_users: keys.len(),
            queued_messages: 0,
        };
        for key in &keys {
            if user_from_queue_key(key).is_some() {
                stats.queued_messages += self.store.len(key).await?;
            }
        }
        Ok(stats)
    }

    async fn discard(&self, key: &str, raw: &str) {
        if let Err(e) = self.store.remove(key, raw).await {
            warn!(key, error = %e, "failed to remove dead offline entry");
        }
    }
}

/// 128-bit random hex coupon binding an id to one push instance.
fn new_ack_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use streamsync_broker::MemoryBackend;

    fn queue() -> OfflineQueue {
        OfflineQueue::new(Arc::new(MemoryBackend::new()))
    }

    fn data(item: &str) -> Map<String, Value> {
        [("item_id".to_string(), json!(item))].into_iter().collect()
    }

    #[test]
    fn ack_tokens_are_32_hex_chars() {
        let token = new_ack_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, new_ack_token());
    }

    #[tokio::test]
    async fn push_pull_ack_round_trip() {
        let q = queue();
        let pushed = q
            .push("u1", EventKind::FavoriteAdded, data("s1"))
            .await
            .unwrap();
        assert!(!pushed.id.is_empty());
        assert!(!pushed.ack_token.is_empty());

        let pulled = q.pull("u1", 100).await.unwrap();
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].id, pushed.id);
        assert!(pulled[0].expires_at > now_millis());

        q.ack("u1", &pushed.id, &pushed.ack_token).await.unwrap();
        assert_eq!(q.count("u1").await.unwrap(), 0);

        // A second ack finds nothing.
        assert!(matches!(
            q.ack("u1", &pushed.id, &pushed.ack_token).await,
            Err(QueueError::NotFound)
        ));
    }

    #[tokio::test]
    async fn ack_with_wrong_token_fails_and_mutates_nothing() {
        let q = queue();
        let pushed = q
            .push("u1", EventKind::HistoryAdded, data("s1"))
            .await
            .unwrap();

        assert!(matches!(
            q.ack("u1", &pushed.id, "deadbeef").await,
            Err(QueueError::Auth)
        ));
        assert_eq!(q.count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn overflow_evicts_the_oldest() {
        let q = queue();
        let mut ids = Vec::new();
        for i in 0..101 {
            let msg = q
                .push("u3", EventKind::HistoryAdded, data(&format!("s{i}")))
                .await
                .unwrap();
            ids.push(msg.id);
        }

        let pulled = q.pull("u3", 200).await.unwrap();
        assert_eq!(pulled.len(), 100);
        // Newest-first: the 101st push is at the head, the first is gone.
        assert_eq!(pulled[0].id, ids[100]);
        assert!(pulled.iter().all(|m| m.id != ids[0]));
    }

    #[tokio::test]
    async fn pull_respects_the_limit_newest_first() {
        let q = queue();
        for i in 0..5 {
            q.push("u1", EventKind::HistoryAdded, data(&format!("s{i}")))
                .await
                .unwrap();
        }
        let pulled = q.pull("u1", 2).await.unwrap();
        assert_eq!(pulled.len(), 2);
        assert_eq!(pulled[0].data["item_id"], "s4");
        assert_eq!(pulled[1].data["item_id"], "s3");
    }

    #[tokio::test]
    async fn expired_entries_are_filtered_and_removed() {
        let q = queue().with_ttl(Duration::from_millis(10));
        q.push("u1", EventKind::HistoryAdded, data("s1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(q.pull("u1", 100).await.unwrap().is_empty());
        // The lazy removal emptied the backing sequence too.
        assert_eq!(q.count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_ack_succeeds_with_at_least_one_valid() {
        let q = queue();
        let a = q.push("u1", EventKind::HistoryAdded, data("a")).await.unwrap();
        let b = q.push("u1", EventKind::HistoryAdded, data("b")).await.unwrap();

        let acked = q
            .batch_ack(
                "u1",
                &[
                    (a.id.clone(), a.ack_token.clone()),
                    (b.id.clone(), "wrong".to_string()),
                    ("missing".to_string(), "whatever".to_string()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(acked, 1);
        assert_eq!(q.count("u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_ack_with_no_valid_pairs_fails() {
        let q = queue();
        q.push("u1", EventKind::HistoryAdded, data("a")).await.unwrap();

        let result = q
            .batch_ack("u1", &[("missing".to_string(), "x".to_string())])
            .await;
        assert!(matches!(result, Err(QueueError::NotFound)));
    }

    #[tokio::test]
    async fn clear_and_count() {
        let q = queue();
        q.push("u1", EventKind::HistoryAdded, data("a")).await.unwrap();
        q.push("u1", EventKind::HistoryAdded, data("b")).await.unwrap();
        assert_eq!(q.count("u1").await.unwrap(), 2);

        q.clear("u1").await.unwrap();
        assert_eq!(q.count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_sweeps_every_queue() {
        let q = queue().with_ttl(Duration::from_millis(10));
        q.push("u1", EventKind::HistoryAdded, data("a")).await.unwrap();
        q.push("u2", EventKind::HistoryAdded, data("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let removed = q.cleanup_expired().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(q.count("u1").await.unwrap(), 0);
        assert_eq!(q.count("u2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stats_aggregate_across_users() {
        let q = queue();
        q.push("u1", EventKind::HistoryAdded, data("a")).await.unwrap();
        q.push("u1", EventKind::HistoryAdded, data("b")).await.unwrap();
        q.push("u2", EventKind::HistoryAdded, data("c")).await.unwrap();

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.queued_users, 2);
        assert_eq!(stats.queued_messages, 3);
    }
}
