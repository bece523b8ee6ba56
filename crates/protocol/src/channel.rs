//! Channel and key naming. These strings are a fleet-wide contract:
//! every node must produce them bit-exactly or cross-node delivery breaks.

/// Channel carrying events for a single user.
pub fn user_channel(user_id: &str) -> String {
    format!("sync:user:{user_id}")
}

/// Pattern matching every user channel.
pub const USER_PATTERN: &str = "sync:user:*";

/// Channel carrying global broadcasts.
pub const BROADCAST_CHANNEL: &str = "sync:broadcast";

/// Channel addressed to a single node (reserved).
pub fn instance_channel(instance_id: &str) -> String {
    format!("sync:instance:{instance_id}")
}

/// Backing-store key for a user's offline queue.
pub fn offline_queue_key(user_id: &str) -> String {
    format!("offline:queue:{user_id}")
}

/// Pattern matching every offline queue key.
pub const OFFLINE_QUEUE_PATTERN: &str = "offline:queue:*";

/// Recover the user id from an offline queue key.
pub fn user_from_queue_key(key: &str) -> Option<&str> {
    key.strip_prefix("offline:queue:")
}
