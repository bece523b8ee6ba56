#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(#[from] redis::RedisError),
    #[error("subscription closed")]
    SubscriptionClosed,
    #[error("broker backend error: {0}")]
    Backend(String),
}
