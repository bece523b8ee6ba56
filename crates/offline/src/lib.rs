//! Per-user bounded durable queue of undelivered events.
//!
//! Every push mints an ack coupon; only the exact `(id, ack_token)` pair
//! removes an entry. The backing sequence store is the serialization point
//! per user, so concurrent pushes cannot overshoot the depth bound.

mod error;
mod queue;

pub use error::QueueError;
pub use queue::{OfflineQueue, QueueStats};
