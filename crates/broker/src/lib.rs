//! Broker abstraction: the pub/sub fabric carrying live fan-out between
//! nodes, and the sequence store backing the offline queue.
//!
//! Both sit behind traits with two implementations: Redis for the
//! production fleet, and an in-process backend for single-node runs and
//! tests. The gateway never talks to Redis directly.

mod backend;
mod error;
mod memory;
mod redis_backend;

pub use backend::{FabricMessage, PubSub, SequenceStore, Subscription, pattern_matches};
pub use error::BrokerError;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
