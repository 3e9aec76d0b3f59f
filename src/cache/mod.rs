//! Read-through cache for previously-computed listings.
//!
//! Best-effort by contract: a failing backend must never fail the business
//! operation that touched it. Callers log and move on. The cache is never
//! consulted for authoritative stock checks.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Cache operation failed: {0}")]
    OperationFailed(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Removes every key matching `pattern` and returns how many went.
    /// Patterns are literal except for a trailing `*` wildcard.
    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError>;
}

// In-memory cache implementation, the default backend
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() > expires_at)
            .unwrap_or(false)
    }
}

fn key_matches(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let store = self.store.read().unwrap();
        if let Some(entry) = store.get(key) {
            if entry.is_expired() {
                drop(store);
                let mut store = self.store.write().unwrap();
                store.remove(key);
                Ok(None)
            } else {
                Ok(Some(entry.value.clone()))
            }
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut store = self.store.write().unwrap();
        store.insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut store = self.store.write().unwrap();
        store.remove(key);
        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut store = self.store.write().unwrap();
        let before = store.len();
        store.retain(|key, _| !key_matches(key, pattern));
        Ok((before - store.len()) as u64)
    }
}

/// Redis-backed cache for multi-instance deployments.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_tokio_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(ttl.as_secs())
                    .arg(value)
                    .query_async::<_, ()>(&mut conn)
                    .await?
            }
            None => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .query_async::<_, ()>(&mut conn)
                    .await?
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(removed)
    }
}

/// Picks a backend from configuration, falling back to in-memory when Redis
/// is unreachable.
pub struct CacheFactory;

impl CacheFactory {
    pub async fn create(config: &crate::config::CacheConfig) -> Arc<dyn CacheBackend> {
        if config.backend == "redis" {
            match RedisCache::connect(&config.redis_url).await {
                Ok(cache) => return Arc::new(cache),
                Err(e) => {
                    warn!(error = %e, "Failed to connect to Redis, falling back to in-memory cache");
                }
            }
        }

        Arc::new(InMemoryCache::new())
    }
}
