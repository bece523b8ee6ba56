use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use streamsync_broker::{PubSub, pattern_matches};
use streamsync_protocol::{MAX_RECONNECTS, RECONNECT_INTERVAL, SyncMessage};

/// Async callback dispatched for messages matching one subscription pattern.
pub type Handler = Arc<dyn Fn(SyncMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Counters for the subscription loop; shared out before `start` consumes
/// the subscriber.
#[derive(Default)]
pub struct SubscriberStats {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped_self: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub dropped_self: u64,
    pub reconnects: u64,
}

impl SubscriberStats {
    pub fn snapshot(&self) -> SubscriberSnapshot {
        SubscriberSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_self: self.dropped_self.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Pattern-subscription loop: receives fabric payloads, filters self-origin
/// copies, and dispatches to the handler registered for the matching
/// pattern. Reconnects with backoff on transport loss.
pub struct Subscriber {
    pubsub: Arc<dyn PubSub>,
    instance_id: String,
    handlers: Vec<(String, Handler)>,
    stats: Arc<SubscriberStats>,
}

impl Subscriber {
    pub fn new(pubsub: Arc<dyn PubSub>, instance_id: impl Into<String>) -> Self {
        Self {
            pubsub,
            instance_id: instance_id.into(),
            handlers: Vec::new(),
            stats: Arc::new(SubscriberStats::default()),
        }
    }

    /// Register a handler keyed by the pattern it was declared with. All
    /// registrations happen before `start`.
    pub fn subscribe(&mut self, pattern: impl Into<String>, handler: Handler) {
        self.handlers.push((pattern.into(), handler));
    }

    pub fn stats(&self) -> Arc<SubscriberStats> {
        Arc::clone(&self.stats)
    }

    /// Run the loop until cancelled or the reconnect budget is spent.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let patterns: Vec<String> = self.handlers.iter().map(|(p, _)| p.clone()).collect();
        let mut attempts: u32 = 0;

        'outer: while !shutdown.is_cancelled() {
            let mut subscription = match self.pubsub.subscribe(&patterns).await {
                Ok(sub) => {
                    if attempts > 0 {
                        debug!(attempts, "fabric subscription re-established");
                    }
                    attempts = 0;
                    sub
                },
                Err(e) => {
                    warn!(error = %e, "fabric subscribe failed");
                    if !self.backoff(&mut attempts, &shutdown).await {
                        break;
                    }
                    continue;
                },
            };

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    item = subscription.next() => match item {
                        Some(Ok(fabric)) => self.dispatch(&fabric.channel, &fabric.payload).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "fabric receive error");
                            self.stats.failed.fetch_add(1, Ordering::Relaxed);
                            if !self.backoff(&mut attempts, &shutdown).await {
                                break 'outer;
                            }
                            continue 'outer;
                        },
                        None => {
                            warn!("fabric subscription dropped");
                            if !self.backoff(&mut attempts, &shutdown).await {
                                break 'outer;
                            }
                            continue 'outer;
                        },
                    },
                }
            }
        }
        debug!("subscriber loop exited");
    }

    /// `false` means stop: budget spent or shutdown requested.
    async fn backoff(&self, attempts: &mut u32, shutdown: &CancellationToken) -> bool {
        *attempts += 1;
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        if *attempts > MAX_RECONNECTS {
            error!(
                attempts = *attempts,
                "fabric reconnect budget exhausted, subscriber stopping"
            );
            return false;
        }
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(RECONNECT_INTERVAL) => true,
        }
    }

    async fn dispatch(&self, channel: &str, payload: &str) {
        let msg = match SyncMessage::decode_fabric(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(channel, error = %e, "dropping malformed fabric payload");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            },
        };
        // The self-origin filter: without it every local publish would come
        // back through the fabric and be delivered twice.
        if msg.instance_id == self.instance_id {
            self.stats.dropped_self.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some((_, handler)) = self
            .handlers
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, channel))
        else {
            debug!(channel, "no handler for fabric channel");
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        handler(msg).await;
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::time::Duration;
    use streamsync_broker::MemoryBackend;
    use streamsync_protocol::EventKind;
    use streamsync_protocol::channel::{BROADCAST_CHANNEL, USER_PATTERN, user_channel};
    use tokio::sync::mpsc;

    fn capture_handler(tx: mpsc::UnboundedSender<SyncMessage>) -> Handler {
        Arc::new(move |msg| -> BoxFuture<'static, ()> {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg);
            })
        })
    }

    fn stamped(kind: EventKind, user: &str, origin: &str) -> String {
        let mut msg = SyncMessage::new(kind, user, Map::new());
        msg.instance_id = origin.into();
        msg.encode().unwrap()
    }

    #[tokio::test]
    async fn dispatches_by_declared_pattern() {
        let backend = Arc::new(MemoryBackend::new());
        let mut sub = Subscriber::new(Arc::clone(&backend) as Arc<dyn PubSub>, "node-a");
        let (user_tx, mut user_rx) = mpsc::unbounded_channel();
        let (bcast_tx, mut bcast_rx) = mpsc::unbounded_channel();
        sub.subscribe(USER_PATTERN, capture_handler(user_tx));
        sub.subscribe(BROADCAST_CHANNEL, capture_handler(bcast_tx));
        let stats = sub.stats();

        let shutdown = CancellationToken::new();
        let handle = sub.start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        backend
            .publish(
                &user_channel("u1"),
                &stamped(EventKind::FavoriteAdded, "u1", "node-b"),
            )
            .await
            .unwrap();
        backend
            .publish(
                BROADCAST_CHANNEL,
                &stamped(EventKind::PlaylistDeleted, "", "node-b"),
            )
            .await
            .unwrap();

        let user_msg = tokio::time::timeout(Duration::from_secs(1), user_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user_msg.kind, EventKind::FavoriteAdded);

        let bcast_msg = tokio::time::timeout(Duration::from_secs(1), bcast_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bcast_msg.kind, EventKind::PlaylistDeleted);

        assert_eq!(stats.snapshot().processed, 2);
        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn self_origin_copies_are_never_dispatched() {
        let backend = Arc::new(MemoryBackend::new());
        let mut sub = Subscriber::new(Arc::clone(&backend) as Arc<dyn PubSub>, "node-a");
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.subscribe(USER_PATTERN, capture_handler(tx));
        let stats = sub.stats();

        let shutdown = CancellationToken::new();
        let handle = sub.start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        backend
            .publish(
                &user_channel("u1"),
                &stamped(EventKind::FavoriteAdded, "u1", "node-a"),
            )
            .await
            .unwrap();
        backend
            .publish(
                &user_channel("u1"),
                &stamped(EventKind::FavoriteAdded, "u1", "node-b"),
            )
            .await
            .unwrap();

        // Only the foreign-origin copy arrives.
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.instance_id, "node-b");
        assert!(rx.try_recv().is_err());

        let snap = stats.snapshot();
        assert_eq!(snap.dropped_self, 1);
        assert_eq!(snap.processed, 1);
        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn payload_without_instance_id_is_counted_failed() {
        let backend = Arc::new(MemoryBackend::new());
        let mut sub = Subscriber::new(Arc::clone(&backend) as Arc<dyn PubSub>, "node-a");
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.subscribe(USER_PATTERN, capture_handler(tx));
        let stats = sub.stats();

        let shutdown = CancellationToken::new();
        let handle = sub.start(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let bare = SyncMessage::new(EventKind::FavoriteAdded, "u1", Map::new())
            .encode()
            .unwrap();
        backend.publish(&user_channel("u1"), &bare).await.unwrap();
        backend
            .publish(&user_channel("u1"), "not json at all")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().failed, 2);
        shutdown.cancel();
        let _ = handle.await;
    }
}
