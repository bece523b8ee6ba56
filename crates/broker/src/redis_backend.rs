//! Redis backend: PUBLISH/PSUBSCRIBE for the fabric, lists with per-key
//! TTL for sequences. A `ConnectionManager` handles command traffic and
//! reconnects; each subscription gets its own dedicated connection.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::backend::{FabricMessage, PubSub, SequenceStore, Subscription};
use crate::error::BrokerError;

pub struct RedisBackend {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!(url, "redis backend connected");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl PubSub for RedisBackend {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn publish_many(&self, channels: &[String], payload: &str) -> Result<usize, BrokerError> {
        if channels.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for channel in channels {
            pipe.publish(channel, payload).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(channels.len())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<Subscription, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await?;
        }
        let stream = pubsub
            .into_on_message()
            .map(|msg| -> Result<FabricMessage, BrokerError> {
                let channel = msg.get_channel_name().to_string();
                let payload: String = msg.get_payload()?;
                Ok(FabricMessage { channel, payload })
            });
        Ok(Subscription {
            receiver: Box::pin(stream),
        })
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[async_trait]
impl SequenceStore for RedisBackend {
    async fn prepend_and_trim(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        // MULTI/EXEC keeps push, trim, and TTL refresh atomic per key.
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, keep as isize - 1)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn remove(&self, key: &str, value: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrem(key, 1, value).await?)
    }

    async fn len(&self, key: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}
