//! In-memory distributed cache for tests/dev (single process).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{CacheError, DistributedCache, TtlCache};

/// Shares the `TtlCache` implementation with L1, without a size bound.
///
/// `set_unavailable(true)` makes every call fail, standing in for an
/// unreachable Redis.
#[derive(Debug)]
pub struct InMemoryDistributedCache {
    inner: TtlCache<String, String>,
    unavailable: AtomicBool,
}

impl InMemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("in-memory cache switched off".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryDistributedCache {
    fn default() -> Self {
        Self {
            inner: TtlCache::unbounded(Duration::from_secs(300)),
            unavailable: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self.inner.get(&key.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.inner.insert_with_ttl(key.to_string(), value.to_string(), ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check()?;
        Ok(self.inner.invalidate(&key.to_string()))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        self.check()?;
        Ok(self.inner.invalidate_if(|k| k.starts_with(prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_delete_leaves_other_namespaces() {
        let cache = InMemoryDistributedCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("warden:perm:t1:u1:GET:/a", "1", ttl).await.unwrap();
        cache.set("warden:perm:t2:u1:GET:/a", "1", ttl).await.unwrap();
        cache.set("warden:snapshot:t1:u1", "{}", ttl).await.unwrap();

        assert_eq!(cache.delete_prefix("warden:perm:t1:").await.unwrap(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_cache_errors() {
        let cache = InMemoryDistributedCache::new();
        cache.set_unavailable(true);
        assert!(matches!(cache.get("k").await, Err(CacheError::Unavailable(_))));
    }
}
