use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::SharedStore;
use crate::error::StoreError;

/// Capacity of each in-process pub/sub channel.
const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process implementation of [`SharedStore`].
///
/// Expiry uses `tokio::time::Instant`, so tests running with paused time can
/// step across window boundaries deterministically.
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Drop expired keys. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.lock();
        let before = data.len();
        data.retain(|_, entry| entry.is_live(now));
        before - data.len()
    }

    /// Adjust a counter and, when `release` says so, replace it with a record
    /// write. Runs under one lock, which is what makes it atomic.
    fn adjust(
        &self,
        counter: &str,
        delta: i64,
        record: (&str, &str),
        release: impl Fn(i64) -> bool,
    ) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let current = match data.get(counter) {
            Some(entry) if entry.is_live(now) => parse_counter(counter, &entry.value)?,
            _ => 0,
        };
        let next = current + delta;
        if release(next) {
            data.remove(counter);
        } else {
            data.insert(
                counter.to_string(),
                Entry {
                    value: next.to_string(),
                    expires_at: None,
                },
            );
        }
        if delta > 0 || release(next) {
            let (key, value) = record;
            data.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            );
        }
        Ok(next)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_counter(key: &str, value: &str) -> Result<i64, StoreError> {
    value.parse().map_err(|_| {
        StoreError::Unavailable(format!("value under {key} is not an integer"))
    })
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .data
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.data.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        by: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        if let Some(entry) = data.get_mut(key).filter(|e| e.is_live(now)) {
            let next = parse_counter(key, &entry.value)?.max(0) as u64 + by;
            entry.value = next.to_string();
            return Ok(next);
        }
        data.insert(
            key.to_string(),
            Entry {
                value: by.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(by)
    }

    async fn incr_and_set(
        &self,
        counter: &str,
        key: &str,
        value: &str,
    ) -> Result<i64, StoreError> {
        self.adjust(counter, 1, (key, value), |_| false)
    }

    async fn decr_and_set_at_zero(
        &self,
        counter: &str,
        key: &str,
        value: &str,
    ) -> Result<i64, StoreError> {
        self.adjust(counter, -1, (key, value), |count| count <= 0)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        if let Some(sender) = self.channels.lock().get(channel) {
            // Err means no subscribers.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
        let rx = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let channel = channel.to_string();
        let stream = futures_util::stream::unfold(rx, move |mut rx| {
            let channel = channel.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => return Some((payload, rx)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(%channel, skipped = n, "memory subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
