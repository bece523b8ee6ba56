use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use streamsync_protocol::{
    EventKind, MAX_MESSAGE_BYTES, PING_PERIOD, PONG_WAIT, SEND_BUFFER, SyncMessage, WRITE_WAIT,
    now_millis,
};

use crate::manager::Manager;

// ── Connection ───────────────────────────────────────────────────────────────

/// Why and when a connection left the ACTIVE state. Recorded exactly once.
#[derive(Debug, Clone)]
pub struct CloseInfo {
    pub reason: String,
    pub closed_at: i64,
}

/// One client session: the shared handle the room and manager hold while
/// the read/write pumps own the socket.
pub struct Connection {
    pub conn_id: String,
    pub user_id: String,
    pub connected_at: i64,
    sender: mpsc::Sender<String>,
    last_pong_ms: AtomicI64,
    active: AtomicBool,
    cancel: CancellationToken,
    close_info: OnceLock<CloseInfo>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Connection {
    /// Build the handle plus the outbound receiver the write pump drains.
    pub fn new(
        user_id: impl Into<String>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (sender, receiver) = mpsc::channel(SEND_BUFFER);
        let now = now_millis();
        let conn = Arc::new(Self {
            conn_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            connected_at: now,
            sender,
            last_pong_ms: AtomicI64::new(now),
            active: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            close_info: OnceLock::new(),
            permit: Mutex::new(permit),
        });
        (conn, receiver)
    }

    /// Non-blocking enqueue. A full buffer means the consumer cannot keep
    /// up: the connection starts closing and the frame is dropped.
    pub fn send(&self, frame: String) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %self.conn_id, user_id = %self.user_id, "send buffer full");
                self.close("send buffer full");
                false
            },
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_message(&self, msg: &SyncMessage) -> bool {
        match msg.encode() {
            Ok(frame) => self.send(frame),
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = %e, "failed to encode outbound message");
                false
            },
        }
    }

    /// Idempotent: the first call records the reason and wakes the pumps;
    /// every later call is a no-op.
    pub fn close(&self, reason: &str) {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.close_info.set(CloseInfo {
                reason: reason.to_string(),
                closed_at: now_millis(),
            });
            self.cancel.cancel();
            debug!(conn_id = %self.conn_id, user_id = %self.user_id, reason, "connection closing");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn close_info(&self) -> Option<&CloseInfo> {
        self.close_info.get()
    }

    pub fn record_pong(&self) {
        self.last_pong_ms.store(now_millis(), Ordering::Relaxed);
    }

    /// Time since the last liveness signal.
    pub fn staleness(&self) -> Duration {
        let stale = now_millis().saturating_sub(self.last_pong_ms.load(Ordering::Relaxed));
        Duration::from_millis(stale.max(0) as u64)
    }

    /// Hand the limiter slot back. Single-shot: the permit can only be
    /// taken out of the connection once.
    pub fn release_slot(&self) {
        if let Ok(mut guard) = self.permit.lock() {
            guard.take();
        }
    }

    pub(crate) fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[cfg(test)]
    pub(crate) fn force_last_pong(&self, ms: i64) {
        self.last_pong_ms.store(ms, Ordering::Relaxed);
    }
}

// ── Socket pumps ─────────────────────────────────────────────────────────────

/// Drive one upgraded socket until either pump exits, then unregister.
pub async fn run_connection(
    socket: WebSocket,
    conn: Arc<Connection>,
    manager: Arc<Manager>,
    outbound: mpsc::Receiver<String>,
) {
    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_pump(ws_tx, Arc::clone(&conn), outbound));
    let reader = tokio::spawn(read_pump(ws_rx, Arc::clone(&conn)));

    // Either pump exiting closes the connection, which cancels the other.
    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
    conn.close("connection closed");
    manager.unregister(Arc::clone(&conn)).await;
}

async fn write_pump(
    mut ws_tx: futures::stream::SplitSink<WebSocket, WsMessage>,
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<String>,
) {
    let cancel = conn.cancelled();
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = outbound.recv() => match maybe {
                Some(frame) => {
                    if ws_tx.send(WsMessage::Text(frame.into())).await.is_err() {
                        conn.close("write error");
                        break;
                    }
                },
                None => break,
            },
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    conn.close("ping failed");
                    break;
                }
            },
        }
    }

    // Best-effort normal closure, bounded so a dead peer cannot hold the
    // task open.
    let reason = conn
        .close_info()
        .map(|i| i.reason.clone())
        .unwrap_or_else(|| "closed".to_string());
    let frame = CloseFrame {
        code: close_code::NORMAL,
        reason: reason.into(),
    };
    let _ = tokio::time::timeout(WRITE_WAIT, ws_tx.send(WsMessage::Close(Some(frame)))).await;
}

async fn read_pump(mut ws_rx: futures::stream::SplitStream<WebSocket>, conn: Arc<Connection>) {
    let cancel = conn.cancelled();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = tokio::time::timeout(PONG_WAIT, ws_rx.next()) => frame,
        };
        match frame {
            // No frame within the pong deadline.
            Err(_) => {
                conn.close("read deadline expired");
                break;
            },
            Ok(None) => {
                conn.close("peer gone");
                break;
            },
            Ok(Some(Err(e))) => {
                debug!(conn_id = %conn.conn_id, error = %e, "read error");
                conn.close("read error");
                break;
            },
            Ok(Some(Ok(msg))) => match msg {
                WsMessage::Text(text) => handle_inbound_text(&conn, text.as_str()),
                WsMessage::Pong(_) => conn.record_pong(),
                // axum answers transport pings automatically.
                WsMessage::Ping(_) => {},
                WsMessage::Binary(_) => {
                    debug!(conn_id = %conn.conn_id, "ignoring binary frame");
                },
                WsMessage::Close(_) => {
                    conn.close("peer close");
                    break;
                },
            },
        }
    }
}

fn handle_inbound_text(conn: &Connection, raw: &str) {
    if raw.len() > MAX_MESSAGE_BYTES {
        warn!(conn_id = %conn.conn_id, len = raw.len(), "oversized frame");
        send_error_frame(conn, "frame too large");
        return;
    }
    match SyncMessage::decode(raw) {
        Ok(msg) => match msg.kind {
            EventKind::Ping => {
                let mut pong = SyncMessage::new(
                    EventKind::Pong,
                    conn.user_id.clone(),
                    serde_json::Map::new(),
                );
                pong.timestamp = now_millis();
                conn.send_message(&pong);
            },
            EventKind::Pong => conn.record_pong(),
            // Hooks for future client-originated kinds.
            other => {
                debug!(conn_id = %conn.conn_id, kind = %other, "ignoring client frame");
            },
        },
        Err(e) => {
            debug!(conn_id = %conn.conn_id, error = %e, "malformed client frame");
            send_error_frame(conn, "malformed frame");
        },
    }
}

fn send_error_frame(conn: &Connection, detail: &str) {
    let frame = serde_json::json!({ "error": detail, "code": "protocol_error" });
    conn.send(frame.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_enqueues_until_the_buffer_fills() {
        let (conn, mut rx) = Connection::new("u1", None);
        for _ in 0..SEND_BUFFER {
            assert!(conn.send("frame".into()));
        }
        // Buffer full: the send fails and the connection starts closing.
        assert!(!conn.send("overflow".into()));
        assert!(!conn.is_active());
        assert_eq!(conn.close_info().map(|i| i.reason.as_str()), Some("send buffer full"));

        // Queued frames are still drainable.
        assert_eq!(rx.recv().await.as_deref(), Some("frame"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _rx) = Connection::new("u1", None);
        conn.close("first");
        conn.close("second");
        let info = conn.close_info().unwrap();
        assert_eq!(info.reason, "first");
        assert!(info.closed_at > 0);
        assert!(!conn.is_active());
    }

    #[tokio::test]
    async fn send_after_close_is_refused() {
        let (conn, _rx) = Connection::new("u1", None);
        conn.close("done");
        assert!(!conn.send("frame".into()));
    }

    #[tokio::test]
    async fn inbound_app_ping_elicits_app_pong() {
        let (conn, mut rx) = Connection::new("u1", None);
        handle_inbound_text(&conn, r#"{"type":"ping","data":{}}"#);

        let frame = rx.recv().await.unwrap();
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.kind, EventKind::Pong);
        assert_eq!(msg.user_id, "u1");
    }

    #[tokio::test]
    async fn inbound_app_pong_refreshes_liveness() {
        let (conn, _rx) = Connection::new("u1", None);
        conn.last_pong_ms.store(0, Ordering::Relaxed);
        assert!(conn.staleness() > Duration::from_secs(1));

        handle_inbound_text(&conn, r#"{"type":"pong","data":{}}"#);
        assert!(conn.staleness() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn malformed_frame_gets_an_error_reply() {
        let (conn, mut rx) = Connection::new("u1", None);
        handle_inbound_text(&conn, "not json");

        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("protocol_error"));
    }

    #[tokio::test]
    async fn unknown_kind_is_ignored_without_reply() {
        let (conn, mut rx) = Connection::new("u1", None);
        handle_inbound_text(&conn, r#"{"type":"history.added","data":{}}"#);
        assert!(rx.try_recv().is_err());
        assert!(conn.is_active());
    }
}
