use async_trait::async_trait;
use redis::AsyncCommands;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session cache unavailable: {0}")]
    Unavailable(String),
}

/// Long-lived key-value cache that holds serialized sessions between runs.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Write several keys as one unit where the backend allows it.
    async fn put_all(&self, entries: &[(&str, &str)], ttl: Duration) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.put(key, value, ttl).await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisSessionStore {
    client: redis::Client,
}

impl RedisSessionStore {
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get(key)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }

    async fn put_all(&self, entries: &[(&str, &str)], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.set_ex(*key, *value, ttl.as_secs().max(1)).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}

/// Process-local store used when no redis is configured, and as the test double.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut guard = self.entries.lock().await;
        match guard.get(key) {
            Some((_, expires)) if *expires <= Instant::now() => {
                guard.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.put_all(&[(key, value)], ttl).await
    }

    async fn put_all(&self, entries: &[(&str, &str)], ttl: Duration) -> Result<(), StoreError> {
        let expires = Instant::now() + ttl;
        let mut guard = self.entries.lock().await;
        for (key, value) in entries {
            guard.insert(key.to_string(), (value.to_string(), expires));
        }
        Ok(())
    }
}
