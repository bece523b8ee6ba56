use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use streamsync_broker::{PubSub, SequenceStore};
use streamsync_offline::OfflineQueue;
use streamsync_protocol::channel::{BROADCAST_CHANNEL, USER_PATTERN};
use streamsync_protocol::{
    BROADCAST_QUEUE_CAP, HEARTBEAT_TIMEOUT, OFFLINE_DRAIN_LIMIT, REGISTER_QUEUE_CAP, SyncMessage,
    UNREGISTER_QUEUE_CAP, now_millis,
};

use crate::connection::Connection;
use crate::heartbeat::{self, LivenessReport};
use crate::limiter::ConnectionLimiter;
use crate::publisher::{Publisher, PublisherStats};
use crate::room::Room;
use crate::subscriber::{Subscriber, SubscriberSnapshot, SubscriberStats};

const SHUTDOWN_DRAIN_GRACE: Duration = Duration::from_secs(5);

// ── Control plumbing ─────────────────────────────────────────────────────────

struct ControlReceivers {
    register_rx: mpsc::Receiver<Arc<Connection>>,
    unregister_rx: mpsc::Receiver<Arc<Connection>>,
    broadcast_rx: mpsc::Receiver<SyncMessage>,
}

struct BackgroundTasks {
    control: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    subscriber: JoinHandle<()>,
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub instance_id: String,
    pub active_connections: usize,
    pub online_users: usize,
    pub connection_capacity: usize,
    pub connections_in_use: usize,
    pub registered_total: u64,
    pub unregistered_total: u64,
    pub local_delivered: u64,
    pub remote_delivered: u64,
    pub queued_offline: u64,
    pub broadcast_all_sent: u64,
    pub broadcast_dropped: u64,
    pub liveness: LivenessReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct PubSubStats {
    pub backend: &'static str,
    pub publisher: PublisherStats,
    pub subscriber: SubscriberSnapshot,
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Per-process coordinator. Owns the room, publisher, subscriber, offline
/// queue, and limiter; serializes structural changes to the connection
/// index through a single control-drain task.
pub struct Manager {
    instance_id: String,
    pubsub: Arc<dyn PubSub>,
    room: Room,
    publisher: Publisher,
    offline: OfflineQueue,
    limiter: ConnectionLimiter,
    connections: RwLock<HashMap<String, Arc<Connection>>>,

    register_tx: mpsc::Sender<Arc<Connection>>,
    unregister_tx: mpsc::Sender<Arc<Connection>>,
    broadcast_tx: mpsc::Sender<SyncMessage>,
    control_rx: Mutex<Option<ControlReceivers>>,
    tasks: Mutex<Option<BackgroundTasks>>,
    subscriber_stats: Mutex<Option<Arc<SubscriberStats>>>,

    /// Offline-drain tasks are owned here so shutdown can wait for them
    /// with bounded grace instead of abandoning detached work.
    drain_tracker: TaskTracker,
    control_cancel: CancellationToken,
    heartbeat_cancel: CancellationToken,
    subscriber_cancel: CancellationToken,

    registered_total: AtomicU64,
    unregistered_total: AtomicU64,
    local_delivered: AtomicU64,
    remote_delivered: AtomicU64,
    queued_offline: AtomicU64,
    broadcast_all_sent: AtomicU64,
    broadcast_dropped: AtomicU64,
}

impl Manager {
    pub fn new(
        instance_id: impl Into<String>,
        pubsub: Arc<dyn PubSub>,
        store: Arc<dyn SequenceStore>,
        max_connections: usize,
    ) -> Arc<Self> {
        let instance_id = instance_id.into();
        let (register_tx, register_rx) = mpsc::channel(REGISTER_QUEUE_CAP);
        let (unregister_tx, unregister_rx) = mpsc::channel(UNREGISTER_QUEUE_CAP);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_CAP);

        Arc::new(Self {
            publisher: Publisher::new(Arc::clone(&pubsub), instance_id.clone()),
            offline: OfflineQueue::new(store),
            limiter: ConnectionLimiter::new(max_connections),
            room: Room::new(),
            connections: RwLock::new(HashMap::new()),
            register_tx,
            unregister_tx,
            broadcast_tx,
            control_rx: Mutex::new(Some(ControlReceivers {
                register_rx,
                unregister_rx,
                broadcast_rx,
            })),
            tasks: Mutex::new(None),
            subscriber_stats: Mutex::new(None),
            drain_tracker: TaskTracker::new(),
            control_cancel: CancellationToken::new(),
            heartbeat_cancel: CancellationToken::new(),
            subscriber_cancel: CancellationToken::new(),
            registered_total: AtomicU64::new(0),
            unregistered_total: AtomicU64::new(0),
            local_delivered: AtomicU64::new(0),
            remote_delivered: AtomicU64::new(0),
            queued_offline: AtomicU64::new(0),
            broadcast_all_sent: AtomicU64::new(0),
            broadcast_dropped: AtomicU64::new(0),
            instance_id,
            pubsub,
        })
    }

    /// Spawn the control-drain task, the heartbeat sweep, and the fabric
    /// subscriber. Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let receivers = match self.control_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(receivers) = receivers else {
            warn!("manager already started");
            return;
        };

        let control = tokio::spawn(Arc::clone(self).control_loop(receivers));
        let hb = tokio::spawn(heartbeat::run(
            Arc::clone(self),
            self.heartbeat_cancel.clone(),
        ));

        let mut subscriber = Subscriber::new(Arc::clone(&self.pubsub), self.instance_id.clone());
        let user_mgr = Arc::clone(self);
        subscriber.subscribe(
            USER_PATTERN,
            Arc::new(move |msg| -> BoxFuture<'static, ()> {
                let mgr = Arc::clone(&user_mgr);
                Box::pin(async move { mgr.handle_fabric_user(msg).await })
            }),
        );
        let bcast_mgr = Arc::clone(self);
        subscriber.subscribe(
            BROADCAST_CHANNEL,
            Arc::new(move |msg| -> BoxFuture<'static, ()> {
                let mgr = Arc::clone(&bcast_mgr);
                Box::pin(async move { mgr.handle_fabric_broadcast(msg).await })
            }),
        );
        if let Ok(mut guard) = self.subscriber_stats.lock() {
            *guard = Some(subscriber.stats());
        }
        let sub_handle = subscriber.start(self.subscriber_cancel.clone());

        if let Ok(mut guard) = self.tasks.lock() {
            *guard = Some(BackgroundTasks {
                control,
                heartbeat: hb,
                subscriber: sub_handle,
            });
        }
        info!(instance_id = %self.instance_id, backend = self.pubsub.backend_name(), "manager started");
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn offline(&self) -> &OfflineQueue {
        &self.offline
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }

    pub fn room(&self) -> &Room {
        &self.room
    }

    // ── Control surface ──────────────────────────────────────────────────

    /// Hand a freshly upgraded connection to the control loop.
    pub async fn register(&self, conn: Arc<Connection>) {
        if self.register_tx.send(conn).await.is_err() {
            warn!("register channel closed; dropping connection");
        }
    }

    /// Queue removal of a connection. Safe to call more than once.
    pub async fn unregister(&self, conn: Arc<Connection>) {
        if self.unregister_tx.send(Arc::clone(&conn)).await.is_err() {
            // Control loop already gone (shutdown); clean up inline.
            self.cleanup_connection(&conn).await;
        }
    }

    /// Non-blocking enqueue onto the broadcast channel. A saturated channel
    /// drops the message: the offline queue is the durable path, this
    /// channel is only the liveness path.
    pub fn try_broadcast(&self, msg: SyncMessage) -> bool {
        match self.broadcast_tx.try_send(msg) {
            Ok(()) => true,
            Err(_) => {
                self.broadcast_dropped.fetch_add(1, Ordering::Relaxed);
                false
            },
        }
    }

    // ── Control loop ─────────────────────────────────────────────────────

    async fn control_loop(self: Arc<Self>, mut rx: ControlReceivers) {
        let cancel = self.control_cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(conn) = rx.register_rx.recv() => self.handle_register(conn).await,
                Some(conn) = rx.unregister_rx.recv() => self.cleanup_connection(&conn).await,
                Some(msg) = rx.broadcast_rx.recv() => self.handle_broadcast(msg).await,
                else => break,
            }
        }
        debug!("control loop exited");
    }

    async fn handle_register(self: &Arc<Self>, conn: Arc<Connection>) {
        {
            let mut connections = self.connections.write().await;
            connections.insert(conn.conn_id.clone(), Arc::clone(&conn));
        }
        self.room.join(Arc::clone(&conn)).await;
        self.registered_total.fetch_add(1, Ordering::Relaxed);
        debug!(conn_id = %conn.conn_id, user_id = %conn.user_id, "connection registered");

        // Replay queued messages off the hot path; the coupon travels with
        // each message and entries stay queued until the client acks.
        let mgr = Arc::clone(self);
        self.drain_tracker.spawn(async move {
            mgr.drain_offline(conn).await;
        });
    }

    async fn drain_offline(&self, conn: Arc<Connection>) {
        let pulled = match self.offline.pull(&conn.user_id, OFFLINE_DRAIN_LIMIT).await {
            Ok(msgs) => msgs,
            Err(e) => {
                error!(user_id = %conn.user_id, error = %e, "offline drain pull failed");
                return;
            },
        };
        if pulled.is_empty() {
            return;
        }
        let mut delivered = 0;
        for msg in &pulled {
            // A close mid-drain leaves the remainder queued for next time.
            if !conn.send_message(&msg.to_sync_message()) {
                break;
            }
            delivered += 1;
        }
        debug!(
            user_id = %conn.user_id,
            delivered,
            pulled = pulled.len(),
            "offline drain complete"
        );
    }

    async fn cleanup_connection(&self, conn: &Arc<Connection>) {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(&conn.conn_id)
        };
        self.room.leave(&conn.user_id, &conn.conn_id).await;
        conn.release_slot();
        conn.close("unregistered");
        if removed.is_some() {
            self.unregistered_total.fetch_add(1, Ordering::Relaxed);
            debug!(conn_id = %conn.conn_id, user_id = %conn.user_id, "connection unregistered");
        }
    }

    async fn handle_broadcast(&self, mut msg: SyncMessage) {
        if msg.user_id.is_empty() {
            self.broadcast_to_all(msg).await;
            return;
        }
        stamp(&mut msg);

        if self.room.is_online(&msg.user_id).await {
            let sent = self.room.broadcast_message(&msg.user_id, &msg).await;
            self.local_delivered.fetch_add(sent as u64, Ordering::Relaxed);
        } else {
            match self
                .offline
                .push(&msg.user_id, msg.kind, msg.data.clone())
                .await
            {
                Ok(_) => {
                    self.queued_offline.fetch_add(1, Ordering::Relaxed);
                },
                Err(e) => {
                    error!(user_id = %msg.user_id, error = %e, "offline enqueue failed");
                },
            }
        }

        // Peers deliver to their own sessions of this user; our copy comes
        // back and dies on the self-origin filter.
        if let Err(e) = self.publisher.publish_to_user(&msg.user_id, &msg).await {
            warn!(user_id = %msg.user_id, error = %e, "fabric publish failed");
        }
    }

    /// Broadcasts are best-effort by contract: locally online users get the
    /// frame, peers deliver to theirs, offline users are not enqueued.
    async fn broadcast_to_all(&self, mut msg: SyncMessage) {
        stamp(&mut msg);
        match msg.encode() {
            Ok(frame) => {
                let sent = self.room.broadcast_all(&frame).await;
                self.broadcast_all_sent.fetch_add(sent as u64, Ordering::Relaxed);
            },
            Err(e) => {
                warn!(error = %e, "broadcast encode failed");
                return;
            },
        }
        if let Err(e) = self.publisher.publish_broadcast(&msg).await {
            warn!(error = %e, "fabric broadcast failed");
        }
    }

    // ── Fabric handlers (run on the subscriber loop) ─────────────────────

    /// The payload's `user_id` is authoritative; the channel name is only
    /// informational. Offline queueing already happened on the origin node.
    async fn handle_fabric_user(&self, msg: SyncMessage) {
        if msg.user_id.is_empty() {
            return;
        }
        if self.room.is_online(&msg.user_id).await {
            let sent = self.room.broadcast_message(&msg.user_id, &msg).await;
            self.remote_delivered.fetch_add(sent as u64, Ordering::Relaxed);
        }
    }

    async fn handle_fabric_broadcast(&self, msg: SyncMessage) {
        if let Ok(frame) = msg.encode() {
            let sent = self.room.broadcast_all(&frame).await;
            self.remote_delivered.fetch_add(sent as u64, Ordering::Relaxed);
        }
    }

    // ── Heartbeat ────────────────────────────────────────────────────────

    /// Close and unregister every connection past the liveness deadline.
    pub(crate) async fn reap_stale(&self) -> usize {
        let mut reaped = 0;
        for conn in self.room.all_connections().await {
            if conn.staleness() > HEARTBEAT_TIMEOUT {
                info!(conn_id = %conn.conn_id, user_id = %conn.user_id, "heartbeat timeout");
                conn.close("heartbeat timeout");
                self.unregister(conn).await;
                reaped += 1;
            }
        }
        reaped
    }

    // ── Stats ────────────────────────────────────────────────────────────

    pub async fn stats(&self) -> ManagerStats {
        let connections = self.room.all_connections().await;
        ManagerStats {
            instance_id: self.instance_id.clone(),
            active_connections: connections.iter().filter(|c| c.is_active()).count(),
            online_users: self.room.online_users().await.len(),
            connection_capacity: self.limiter.capacity(),
            connections_in_use: self.limiter.in_use(),
            registered_total: self.registered_total.load(Ordering::Relaxed),
            unregistered_total: self.unregistered_total.load(Ordering::Relaxed),
            local_delivered: self.local_delivered.load(Ordering::Relaxed),
            remote_delivered: self.remote_delivered.load(Ordering::Relaxed),
            queued_offline: self.queued_offline.load(Ordering::Relaxed),
            broadcast_all_sent: self.broadcast_all_sent.load(Ordering::Relaxed),
            broadcast_dropped: self.broadcast_dropped.load(Ordering::Relaxed),
            liveness: heartbeat::report(&connections),
        }
    }

    pub fn pubsub_stats(&self) -> PubSubStats {
        let subscriber = self
            .subscriber_stats
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.snapshot()))
            .unwrap_or(SubscriberSnapshot {
                processed: 0,
                failed: 0,
                dropped_self: 0,
                reconnects: 0,
            });
        PubSubStats {
            backend: self.pubsub.backend_name(),
            publisher: self.publisher.stats(),
            subscriber,
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Orderly teardown: heartbeat, then subscriber, then publisher, then a
    /// snapshot of connections; finally wait (bounded) for offline drains.
    pub async fn shutdown(&self) {
        info!("manager shutting down");
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        self.heartbeat_cancel.cancel();
        self.subscriber_cancel.cancel();
        let control = if let Some(BackgroundTasks {
            control,
            heartbeat,
            subscriber,
        }) = tasks
        {
            let _ = heartbeat.await;
            let _ = subscriber.await;
            Some(control)
        } else {
            None
        };

        self.publisher.close();

        let snapshot: Vec<Arc<Connection>> = {
            let connections = self.connections.read().await;
            connections.values().cloned().collect()
        };
        for conn in snapshot {
            conn.close("server shutdown");
            self.cleanup_connection(&conn).await;
        }

        self.drain_tracker.close();
        if tokio::time::timeout(SHUTDOWN_DRAIN_GRACE, self.drain_tracker.wait())
            .await
            .is_err()
        {
            warn!("offline drain tasks did not finish within grace");
        }

        self.control_cancel.cancel();
        if let Some(control) = control {
            let _ = control.await;
        }
        info!("manager shutdown complete");
    }
}

/// Fill in `id` and `timestamp` when the origin left them empty.
fn stamp(msg: &mut SyncMessage) {
    if msg.id.is_empty() {
        msg.id = uuid::Uuid::new_v4().to_string();
    }
    if msg.timestamp == 0 {
        msg.timestamp = now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};
    use streamsync_broker::MemoryBackend;
    use streamsync_protocol::EventKind;

    fn test_manager(backend: &Arc<MemoryBackend>, instance: &str) -> Arc<Manager> {
        let mgr = Manager::new(
            instance,
            Arc::clone(backend) as Arc<dyn PubSub>,
            Arc::clone(backend) as Arc<dyn SequenceStore>,
            100,
        );
        mgr.start();
        mgr
    }

    fn event(kind: EventKind, user: &str, item: &str) -> SyncMessage {
        let data: Map<String, Value> = [("item_id".to_string(), json!(item))].into_iter().collect();
        SyncMessage::new(kind, user, data)
    }

    async fn eventually(mut cond: impl AsyncFnMut() -> bool, what: &str) {
        for _ in 0..400 {
            if cond().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn local_fan_out_reaches_the_live_session() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = test_manager(&backend, "node-a");

        let (conn, mut rx) = Connection::new("u1", None);
        mgr.register(Arc::clone(&conn)).await;
        eventually(async || mgr.room().is_online("u1").await, "u1 online").await;

        assert!(mgr.try_broadcast(event(EventKind::FavoriteAdded, "u1", "s1")));

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("open channel");
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.kind, EventKind::FavoriteAdded);
        assert_eq!(msg.data["item_id"], "s1");
        assert!(!msg.id.is_empty());

        assert_eq!(mgr.offline().count("u1").await.unwrap(), 0);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn events_for_absent_users_are_queued_and_drained_on_connect() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = test_manager(&backend, "node-a");

        assert!(mgr.try_broadcast(event(EventKind::FavoriteAdded, "u2", "s9")));
        eventually(
            async || mgr.offline().count("u2").await.unwrap() == 1,
            "offline enqueue",
        )
        .await;

        let (conn, mut rx) = Connection::new("u2", None);
        mgr.register(conn).await;

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("drained frame within deadline")
            .expect("open channel");
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.kind, EventKind::FavoriteAdded);
        assert!(!msg.ack_token.is_empty());

        // Unacked delivery leaves the entry queued; the ack removes it.
        assert_eq!(mgr.offline().count("u2").await.unwrap(), 1);
        mgr.offline().ack("u2", &msg.id, &msg.ack_token).await.unwrap();
        assert_eq!(mgr.offline().count("u2").await.unwrap(), 0);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn cross_node_fan_out_with_self_origin_filtering() {
        let backend = Arc::new(MemoryBackend::new());
        let node_a = test_manager(&backend, "node-a");
        let node_b = test_manager(&backend, "node-b");

        let (conn, mut rx) = Connection::new("u1", None);
        node_a.register(conn).await;
        eventually(async || node_a.room().is_online("u1").await, "u1 online on a").await;

        assert!(node_b.try_broadcast(event(EventKind::PlaylistUpdated, "u1", "p1")));

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("cross-node frame within deadline")
            .expect("open channel");
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.kind, EventKind::PlaylistUpdated);
        assert_eq!(msg.instance_id, "node-b");

        eventually(
            async || node_b.pubsub_stats().subscriber.dropped_self == 1,
            "self-origin drop on b",
        )
        .await;
        eventually(
            async || node_a.pubsub_stats().subscriber.processed == 1,
            "processed count on a",
        )
        .await;
        assert_eq!(node_b.pubsub_stats().publisher.published, 1);

        node_a.shutdown().await;
        node_b.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_to_all_is_fire_and_forget() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = test_manager(&backend, "node-a");

        let (a, mut rx_a) = Connection::new("u1", None);
        let (b, mut rx_b) = Connection::new("u2", None);
        mgr.register(a).await;
        mgr.register(b).await;
        eventually(
            async || mgr.room().online_users().await.len() == 2,
            "both online",
        )
        .await;

        let mut msg = event(EventKind::PlaylistDeleted, "", "p1");
        msg.user_id = String::new();
        assert!(mgr.try_broadcast(msg));

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("broadcast frame within deadline")
                .expect("open channel");
            assert!(frame.contains("playlist.deleted"));
        }

        // Offline users never see broadcasts: nothing was queued.
        let stats = mgr.offline().stats().await.unwrap();
        assert_eq!(stats.queued_messages, 0);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn stale_connections_are_reaped() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = test_manager(&backend, "node-a");

        let (conn, _rx) = Connection::new("u4", None);
        mgr.register(Arc::clone(&conn)).await;
        eventually(async || mgr.room().is_online("u4").await, "u4 online").await;

        conn.force_last_pong(0);
        let reaped = mgr.reap_stale().await;
        assert_eq!(reaped, 1);

        eventually(async || !mgr.room().is_online("u4").await, "u4 reaped").await;
        assert_eq!(
            conn.close_info().map(|i| i.reason.as_str()),
            Some("heartbeat timeout")
        );
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_the_connection_snapshot() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = test_manager(&backend, "node-a");

        let (conn, _rx) = Connection::new("u1", None);
        mgr.register(Arc::clone(&conn)).await;
        eventually(async || mgr.room().is_online("u1").await, "u1 online").await;

        mgr.shutdown().await;
        assert!(!conn.is_active());
        assert_eq!(
            conn.close_info().map(|i| i.reason.as_str()),
            Some("server shutdown")
        );
        assert_eq!(mgr.room().total_connections().await, 0);
    }

    #[tokio::test]
    async fn register_after_capacity_release() {
        let backend = Arc::new(MemoryBackend::new());
        let mgr = test_manager(&backend, "node-a");

        let permit = mgr.limiter().acquire().unwrap();
        let (conn, _rx) = Connection::new("u1", Some(permit));
        mgr.register(Arc::clone(&conn)).await;
        eventually(async || mgr.room().is_online("u1").await, "u1 online").await;
        assert_eq!(mgr.limiter().in_use(), 1);

        mgr.unregister(Arc::clone(&conn)).await;
        eventually(async || mgr.limiter().in_use() == 0, "slot released").await;
        assert!(!conn.is_active());
        mgr.shutdown().await;
    }
}
