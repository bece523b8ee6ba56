//! Wire types and constants shared by the gateway, broker, and offline queue.
//!
//! Everything that crosses a process boundary lives here: the `SyncMessage`
//! fan-out unit, the offline envelope with its ack coupon, channel naming,
//! and the tunables both sides of a connection must agree on.

pub mod channel;
pub mod message;
pub mod offline;

pub use message::{AckEntry, EventKind, ProtocolError, SyncMessage};
pub use offline::OfflineMessage;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest frame accepted on any ingest path, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Per-user offline queue depth; the oldest entries are evicted beyond this.
pub const MAX_QUEUE: usize = 100;

/// How long an offline message stays deliverable.
pub const OFFLINE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Grace added to the backing key's TTL so abandoned queues self-evict
/// strictly after their newest entry expires.
pub const OFFLINE_KEY_GRACE: Duration = Duration::from_secs(24 * 60 * 60);

/// Messages drained to a freshly registered connection.
pub const OFFLINE_DRAIN_LIMIT: usize = 50;

/// Per-connection outbound buffer depth.
pub const SEND_BUFFER: usize = 256;

/// Read deadline refreshed on every inbound frame. Must exceed [`PING_PERIOD`].
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Transport-level ping cadence on an otherwise idle writer.
pub const PING_PERIOD: Duration = Duration::from_secs(30);

/// Bound on the closing handshake write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Heartbeat sweep cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A connection silent for longer than this is reaped.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// Fleet-local concurrent session cap.
pub const MAX_CONNECTIONS: usize = 10_000;

/// Subscriber reconnect backoff and attempt cap.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_RECONNECTS: u32 = 10;

/// Manager control-channel capacities.
pub const REGISTER_QUEUE_CAP: usize = 256;
pub const UNREGISTER_QUEUE_CAP: usize = 256;
pub const BROADCAST_QUEUE_CAP: usize = 1024;

/// Ingress rate limit: requests per identity per window.
pub const RATE_LIMIT_MAX_REQUESTS: usize = 120;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
