use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::error::BrokerError;

/// One payload received from the fabric, tagged with the channel it
/// arrived on.
#[derive(Debug, Clone)]
pub struct FabricMessage {
    pub channel: String,
    pub payload: String,
}

/// A live pattern subscription. The stream ends (or yields an error) when
/// the underlying transport drops; the caller owns reconnection.
pub struct Subscription {
    pub receiver: Pin<Box<dyn Stream<Item = Result<FabricMessage, BrokerError>> + Send>>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<Result<FabricMessage, BrokerError>> {
        self.receiver.as_mut().next().await
    }
}

/// Fire-and-forget, at-most-once pub/sub.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Emit one payload on one channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Emit the same payload on many channels in a single transport
    /// round-trip. Not all-or-nothing: a failure fails the whole batch and
    /// the caller accounts it as such.
    async fn publish_many(&self, channels: &[String], payload: &str) -> Result<usize, BrokerError>;

    /// Pattern-subscribe (`*` wildcard) to a set of patterns at once.
    async fn subscribe(&self, patterns: &[String]) -> Result<Subscription, BrokerError>;

    /// Backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Per-key ordered sequence storage with TTL, the serialization point for
/// a user's offline queue.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Prepend `value`, truncate the sequence to the newest `keep` entries,
    /// and refresh the key's TTL, atomically with respect to concurrent
    /// calls for the same key.
    async fn prepend_and_trim(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl: Duration,
    ) -> Result<(), BrokerError>;

    /// Inclusive range scan; negative indices count from the tail, so
    /// `range(key, 0, -1)` is the full sequence newest-first.
    async fn range(&self, key: &str, start: isize, stop: isize)
    -> Result<Vec<String>, BrokerError>;

    /// Remove the first occurrence of `value`; returns the removed count.
    async fn remove(&self, key: &str, value: &str) -> Result<u64, BrokerError>;

    async fn len(&self, key: &str) -> Result<u64, BrokerError>;

    async fn delete(&self, key: &str) -> Result<(), BrokerError>;

    /// Keys matching a `*` glob pattern.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError>;
}

/// Minimal `*` glob: every literal segment must appear in order, with the
/// first and last anchored unless the pattern is open on that side.
pub fn pattern_matches(pattern: &str, subject: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == subject;
    }
    let mut rest = subject;
    let segments: Vec<&str> = pattern.split('*').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::pattern_matches;

    #[test]
    fn exact_patterns() {
        assert!(pattern_matches("sync:broadcast", "sync:broadcast"));
        assert!(!pattern_matches("sync:broadcast", "sync:broadcast:extra"));
    }

    #[test]
    fn trailing_wildcard() {
        assert!(pattern_matches("sync:user:*", "sync:user:u1"));
        assert!(pattern_matches("sync:user:*", "sync:user:"));
        assert!(!pattern_matches("sync:user:*", "sync:instance:u1"));
    }

    #[test]
    fn interior_wildcard() {
        assert!(pattern_matches("sync:*:u1", "sync:user:u1"));
        assert!(!pattern_matches("sync:*:u1", "sync:user:u2"));
    }
}
