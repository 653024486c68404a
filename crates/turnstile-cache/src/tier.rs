use crate::error::{CacheError, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A shared, out-of-process cache tier.
///
/// Consulted only on first-tier misses; a hit promotes the value back
/// into the first tier.
#[async_trait]
pub trait TierStore<V>: Send + Sync + 'static {
    /// Returns `Ok(None)` if the key is not in this tier.
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Stores a value with an optional TTL.
    async fn set(&self, key: &str, value: &V, ttl: Option<Duration>) -> Result<()>;

    /// Removes a key. Not an error if it does not exist.
    async fn del(&self, key: &str) -> Result<()>;
}

/// A Redis-backed [`TierStore`].
///
/// Values are stored as JSON strings under a configurable key prefix.
#[derive(Debug, Clone)]
pub struct RedisTier<V> {
    conn: redis::aio::MultiplexedConnection,
    key_prefix: String,
    _marker: PhantomData<fn() -> V>,
}

impl<V> RedisTier<V> {
    pub fn new(conn: redis::aio::MultiplexedConnection) -> Self {
        Self::with_prefix(conn, "ts:rule:")
    }

    pub fn with_prefix(
        conn: redis::aio::MultiplexedConnection,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            _marker: PhantomData,
        }
    }

    fn tier_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl<V> TierStore<V> for RedisTier<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>> {
        let tier_key = self.tier_key(key);
        trace!(key, "fetching from redis tier");

        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(&tier_key).await {
            Ok(Some(cached)) => match serde_json::from_str::<V>(&cached) {
                Ok(value) => {
                    debug!(key, "redis tier hit");
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!(key, error = %e, "failed to deserialize cached value");
                    Ok(None)
                }
            },
            Ok(None) => {
                trace!(key, "redis tier miss");
                Ok(None)
            }
            Err(e) => {
                warn!(key, error = %e, "redis error on get");
                Err(CacheError::Unavailable(e.to_string()))
            }
        }
    }

    async fn set(&self, key: &str, value: &V, ttl: Option<Duration>) -> Result<()> {
        let tier_key = self.tier_key(key);
        trace!(key, "storing in redis tier");

        let json =
            serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let result = if let Some(ttl) = ttl {
            conn.set_ex::<_, _, ()>(&tier_key, json, ttl.as_secs().max(1))
                .await
        } else {
            conn.set::<_, _, ()>(&tier_key, json).await
        };

        result.map_err(|e| {
            warn!(key, error = %e, "failed to store in redis tier");
            CacheError::Unavailable(e.to_string())
        })
    }

    async fn del(&self, key: &str) -> Result<()> {
        let tier_key = self.tier_key(key);
        trace!(key, "removing from redis tier");

        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&tier_key).await.map_err(|e| {
            warn!(key, error = %e, "failed to remove from redis tier");
            CacheError::Unavailable(e.to_string())
        })
    }
}

// Unit tests for tier behaviour run against the in-memory fake in
// tiered.rs; exercising RedisTier needs a running Redis instance and
// belongs in a separate integration suite.
