//! In-process backend: pub/sub over per-subscriber channels, sequences in
//! a mutex-guarded map. Single-node runs and tests; no durability across
//! restarts.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::backend::{FabricMessage, PubSub, SequenceStore, Subscription, pattern_matches};
use crate::error::BrokerError;

struct MemorySubscriber {
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<FabricMessage>,
}

struct StoredSequence {
    items: VecDeque<String>,
    expires_at: Option<Instant>,
}

impl StoredSequence {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    subscribers: Mutex<Vec<MemorySubscriber>>,
    sequences: Mutex<HashMap<String, StoredSequence>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn fan_out(&self, channel: &str, payload: &str) {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|sub| {
            if sub.patterns.iter().any(|p| pattern_matches(p, channel)) {
                sub.tx
                    .send(FabricMessage {
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                    })
                    .is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
    }
}

#[async_trait]
impl PubSub for MemoryBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        self.fan_out(channel, payload).await;
        Ok(())
    }

    async fn publish_many(&self, channels: &[String], payload: &str) -> Result<usize, BrokerError> {
        for channel in channels {
            self.fan_out(channel, payload).await;
        }
        Ok(channels.len())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(MemorySubscriber {
            patterns: patterns.to_vec(),
            tx,
        });
        let stream = UnboundedReceiverStream::new(rx).map(Ok::<FabricMessage, BrokerError>);
        Ok(Subscription {
            receiver: Box::pin(stream),
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl SequenceStore for MemoryBackend {
    async fn prepend_and_trim(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut sequences = self.sequences.lock().await;
        let seq = sequences.entry(key.to_string()).or_insert(StoredSequence {
            items: VecDeque::new(),
            expires_at: None,
        });
        if seq.is_expired(now) {
            seq.items.clear();
        }
        seq.items.push_front(value.to_string());
        seq.items.truncate(keep);
        seq.expires_at = Some(now + ttl);
        Ok(())
    }

    async fn range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, BrokerError> {
        let now = Instant::now();
        let sequences = self.sequences.lock().await;
        let Some(seq) = sequences.get(key).filter(|s| !s.is_expired(now)) else {
            return Ok(Vec::new());
        };
        let len = seq.items.len() as isize;
        let clamp = |i: isize| -> isize {
            let i = if i < 0 { i + len } else { i };
            i.clamp(0, len.max(1) - 1)
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let (start, stop) = (clamp(start), clamp(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(seq
            .items
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn remove(&self, key: &str, value: &str) -> Result<u64, BrokerError> {
        let now = Instant::now();
        let mut sequences = self.sequences.lock().await;
        let Some(seq) = sequences.get_mut(key).filter(|s| !s.is_expired(now)) else {
            return Ok(0);
        };
        match seq.items.iter().position(|v| v == value) {
            Some(pos) => {
                seq.items.remove(pos);
                Ok(1)
            },
            None => Ok(0),
        }
    }

    async fn len(&self, key: &str) -> Result<u64, BrokerError> {
        let now = Instant::now();
        let sequences = self.sequences.lock().await;
        Ok(sequences
            .get(key)
            .filter(|s| !s.is_expired(now))
            .map_or(0, |s| s.items.len() as u64))
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.sequences.lock().await.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let now = Instant::now();
        let sequences = self.sequences.lock().await;
        Ok(sequences
            .iter()
            .filter(|(k, s)| !s.is_expired(now) && pattern_matches(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
