use streamsync_broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Ack token does not match the stored coupon. No state is mutated.
    #[error("ack token mismatch")]
    Auth,
    /// No queued message with that id.
    #[error("message not found")]
    NotFound,
    #[error("offline storage error: {0}")]
    Storage(#[from] BrokerError),
    #[error("offline envelope error: {0}")]
    Codec(#[from] serde_json::Error),
}
