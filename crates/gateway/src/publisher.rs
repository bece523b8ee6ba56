use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tracing::debug;

use streamsync_broker::{BrokerError, PubSub};
use streamsync_protocol::channel::{BROADCAST_CHANNEL, instance_channel, user_channel};
use streamsync_protocol::{ProtocolError, SyncMessage};

/// Emits messages onto the fabric, stamped with this node's identity so
/// peers can drop our own copies.
pub struct Publisher {
    pubsub: Arc<dyn PubSub>,
    instance_id: String,
    published: AtomicU64,
    failed: AtomicU64,
    closed: AtomicBool,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Codec(#[from] ProtocolError),
    #[error("publisher closed")]
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
}

impl Publisher {
    pub fn new(pubsub: Arc<dyn PubSub>, instance_id: impl Into<String>) -> Self {
        Self {
            pubsub,
            instance_id: instance_id.into(),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn publish_to_user(
        &self,
        user_id: &str,
        msg: &SyncMessage,
    ) -> Result<(), PublishError> {
        self.emit(&user_channel(user_id), msg).await
    }

    pub async fn publish_broadcast(&self, msg: &SyncMessage) -> Result<(), PublishError> {
        self.emit(BROADCAST_CHANNEL, msg).await
    }

    pub async fn publish_to_instance(
        &self,
        instance_id: &str,
        msg: &SyncMessage,
    ) -> Result<(), PublishError> {
        self.emit(&instance_channel(instance_id), msg).await
    }

    /// Serialize once, emit one frame per user in a single batched
    /// round-trip. Not all-or-nothing: a transport failure fails the batch
    /// and is accounted as one failure.
    pub async fn publish_to_users(
        &self,
        user_ids: &[String],
        msg: &SyncMessage,
    ) -> Result<usize, PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        let payload = self.stamp(msg)?;
        let channels: Vec<String> = user_ids.iter().map(|u| user_channel(u)).collect();
        match self.pubsub.publish_many(&channels, &payload).await {
            Ok(sent) => {
                self.published.fetch_add(sent as u64, Ordering::Relaxed);
                Ok(sent)
            },
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            },
        }
    }

    /// Refuse further emissions; part of the shutdown sequence.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!("publisher closed");
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    async fn emit(&self, channel: &str, msg: &SyncMessage) -> Result<(), PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        let payload = self.stamp(msg)?;
        match self.pubsub.publish(channel, &payload).await {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            },
        }
    }

    fn stamp(&self, msg: &SyncMessage) -> Result<String, ProtocolError> {
        let mut stamped = msg.clone();
        stamped.instance_id = self.instance_id.clone();
        stamped.encode()
    }
}
