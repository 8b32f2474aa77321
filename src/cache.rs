use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend failed: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("cache payload invalid: {0}")]
    Payload(#[from] serde_json::Error),
}

pub fn cache_key(call_id: &str, tree_path: &str) -> String {
    format!("stage1:{}:{}", call_id, tree_path)
}

/// Transient storage for intermediate routing results, keyed by
/// (call id, tree path). A get after a put of the same key within the TTL
/// returns the stored bytes unchanged; concurrent puts for distinct keys are
/// fine.
#[async_trait]
pub trait RoutingCache: Send + Sync {
    async fn put(
        &self,
        call_id: &str,
        tree_path: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError>;
    async fn get(&self, call_id: &str, tree_path: &str) -> Result<Option<Vec<u8>>, CacheError>;
}

/// In-process backend for single-server installations and tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Instant, Vec<u8>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoutingCache for MemoryCache {
    async fn put(
        &self,
        call_id: &str,
        tree_path: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        entries.insert(cache_key(call_id, tree_path), (Instant::now() + ttl, payload.to_vec()));
        Ok(())
    }

    async fn get(&self, call_id: &str, tree_path: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = cache_key(call_id, tree_path);
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some((deadline, payload)) if *deadline > Instant::now() => Ok(Some(payload.clone())),
            Some(_) => {
                entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Shared backend for multi-server installations: a table in the relational
/// store that every routing daemon of the site can reach.
pub struct DbCache {
    pool: PgPool,
}

impl DbCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let pool = PgPoolOptions::new().max_connections(4).connect(url).await?;
        let cache = Self { pool };
        cache.ensure_table().await?;
        info!("connected to shared routing cache");
        Ok(cache)
    }

    async fn ensure_table(&self) -> Result<(), CacheError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS routing_cache (\
                cache_key TEXT PRIMARY KEY, \
                payload BYTEA NOT NULL, \
                expires_at BIGINT NOT NULL\
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn epoch_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl RoutingCache for DbCache {
    async fn put(
        &self,
        call_id: &str,
        tree_path: &str,
        payload: &[u8],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = Self::epoch_secs();
        // Expired rows are reaped opportunistically on writes.
        sqlx::query("DELETE FROM routing_cache WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO routing_cache (cache_key, payload, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (cache_key) DO UPDATE SET payload = $2, expires_at = $3",
        )
        .bind(cache_key(call_id, tree_path))
        .bind(payload)
        .bind(now + ttl.as_secs() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, call_id: &str, tree_path: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT payload FROM routing_cache WHERE cache_key = $1 AND expires_at > $2")
                .bind(cache_key(call_id, tree_path))
                .bind(Self::epoch_secs())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(payload,)| payload))
    }
}
