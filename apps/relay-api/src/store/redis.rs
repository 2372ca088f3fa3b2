use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::SharedStore;
use crate::error::StoreError;

/// INCRBY that sets a millisecond expiry only when the key is created.
const INCR_WITH_EXPIRY: &str = r#"
local v = redis.call('INCRBY', KEYS[1], ARGV[1])
if v == tonumber(ARGV[1]) then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return v
"#;

/// INCR a holder counter and write the record it guards.
const INCR_AND_SET: &str = r#"
local v = redis.call('INCR', KEYS[1])
redis.call('SET', KEYS[2], ARGV[1])
return v
"#;

/// DECR a holder counter; on release, drop it and write the record.
const DECR_AND_SET_AT_ZERO: &str = r#"
local v = redis.call('DECR', KEYS[1])
if v <= 0 then
  redis.call('DEL', KEYS[1])
  redis.call('SET', KEYS[2], ARGV[1])
end
return v
"#;

/// Redis-backed [`SharedStore`] for multi-instance deployments.
///
/// Commands go through a shared `ConnectionManager` (reconnects on its own);
/// each subscription opens a dedicated pub/sub connection.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        tracing::info!("redis store connected");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        by: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(INCR_WITH_EXPIRY);
        let count: u64 = script
            .key(key)
            .arg(by)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn incr_and_set(
        &self,
        counter: &str,
        key: &str,
        value: &str,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::Script::new(INCR_AND_SET)
            .key(counter)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn decr_and_set_at_zero(
        &self,
        counter: &str,
        key: &str,
        value: &str,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::Script::new(DECR_AND_SET_AT_ZERO)
            .key(counter)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        tracing::info!(%channel, "subscribed to redis channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::error!(?e, "unreadable redis payload");
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
