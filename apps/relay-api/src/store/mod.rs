//! Shared key-value and publish/subscribe substrate.
//!
//! Presence records, rate-limit counters and the cross-process relay all go
//! through [`SharedStore`]. Backed by Redis in multi-instance deployments and
//! by an in-process map for single-instance runs and tests.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically add `by` to the counter under `key` and return the new
    /// value. The expiry is set only when this call creates the key, so the
    /// counter lives exactly `ttl` from its first increment.
    async fn incr_with_expiry(&self, key: &str, by: u64, ttl: Duration)
        -> Result<u64, StoreError>;

    /// Increment the non-expiring counter under `counter` and set `key` to
    /// `value` as one atomic step. Returns the new count.
    async fn incr_and_set(&self, counter: &str, key: &str, value: &str)
        -> Result<i64, StoreError>;

    /// Decrement the non-expiring counter under `counter` as one atomic step.
    /// When the count reaches zero or below, the counter is deleted and `key`
    /// is set to `value` in that same step. Returns the new count.
    async fn decr_and_set_at_zero(&self, counter: &str, key: &str, value: &str)
        -> Result<i64, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to a channel. The stream ends when the subscription drops.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError>;
}
