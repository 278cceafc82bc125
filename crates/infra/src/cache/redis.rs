//! Redis-backed distributed cache (optional).

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::{CacheError, DistributedCache};

const DELETE_BATCH: usize = 500;

/// L2 cache over a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisDistributedCache {
    conn: ConnectionManager,
}

impl RedisDistributedCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self { conn })
    }
}

fn unavailable(e: redis::RedisError) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

/// Escapes glob metacharacters so the prefix is matched literally by SCAN.
fn escape_glob(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

#[async_trait]
impl DistributedCache for RedisDistributedCache {
    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(unavailable)
    }

    #[instrument(skip(self, value), err)]
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(unavailable)
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    #[instrument(skip(self), err)]
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut scan_conn = self.conn.clone();
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = scan_conn
                .scan_match::<_, String>(escape_glob(prefix))
                .await
                .map_err(unavailable)?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }

        let mut conn = self.conn.clone();
        let mut removed = 0usize;
        for chunk in keys.chunks(DELETE_BATCH) {
            let n: i64 = conn.del(chunk).await.map_err(unavailable)?;
            removed += usize::try_from(n).unwrap_or(0);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("warden:perm:t*1:"), "warden:perm:t\\*1:*");
    }
}
