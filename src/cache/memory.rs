use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use retainer::entry::CacheExpiration;
use tokio::sync::Mutex;

use super::{Cache, CacheError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expiration(&self) -> CacheExpiration {
        match self.expires_at {
            Some(at) => CacheExpiration::from(at.saturating_duration_since(Instant::now())),
            None => CacheExpiration::none(),
        }
    }
}

/// In-process cache for single-process deployments and tests.
///
/// Mutations take the key-index lock, which makes `incr`/`add` atomic within
/// the process. Multi-process deployments must use [`super::RedisCache`].
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<retainer::Cache<String, Entry>>,
    keys: Arc<Mutex<BTreeSet<String>>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(retainer::Cache::new()),
            keys: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Periodically purges expired entries; run it on a background task.
    pub async fn monitor(&self, frequency: Duration) {
        let mut interval = tokio::time::interval(frequency);
        loop {
            interval.tick().await;
            let purged = self.purge().await;
            if purged > 0 {
                tracing::debug!(kind = "cache", purged = purged, "Expired entries purged");
            }
        }
    }

    /// Drops every expired entry together with its slot in the key index.
    pub async fn purge(&self) -> usize {
        let mut keys = self.keys.lock().await;
        let mut expired = vec![];
        for key in keys.iter() {
            if self.live(key).await.is_none() {
                expired.push(key.clone());
            }
        }
        for key in expired.iter() {
            self.entries.remove(key).await;
            keys.remove(key);
        }
        expired.len()
    }

    async fn live(&self, key: &str) -> Option<Entry> {
        let guard = self.entries.get(&key.to_string()).await?;
        let entry: Entry = (*guard).clone();
        drop(guard);
        match entry.expires_at {
            Some(at) if at <= Instant::now() => None,
            _ => Some(entry),
        }
    }

    async fn store(&self, key: &str, value: String, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        let expiration = entry.expiration();
        self.entries.insert(key.to_string(), entry, expiration).await;
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.live(key).await.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut keys = self.keys.lock().await;
        self.store(key, value.to_string(), ttl).await;
        keys.insert(key.to_string());
        Ok(())
    }

    async fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, CacheError> {
        let mut keys = self.keys.lock().await;
        if self.live(key).await.is_some() {
            return Ok(false);
        }
        self.store(key, value.to_string(), ttl).await;
        keys.insert(key.to_string());
        Ok(true)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError> {
        let mut keys = self.keys.lock().await;
        let next = match self.live(key).await {
            None => {
                self.store(key, "1".to_string(), Some(ttl)).await;
                1
            }
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| CacheError::NotACounter {
                    key: key.to_string(),
                    value: entry.value.clone(),
                })?;
                let next = current + 1;
                let updated = Entry {
                    value: next.to_string(),
                    expires_at: entry.expires_at,
                };
                let expiration = updated.expiration();
                self.entries.insert(key.to_string(), updated, expiration).await;
                next
            }
        };
        keys.insert(key.to_string());
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut keys = self.keys.lock().await;
        self.entries.remove(&key.to_string()).await;
        keys.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut keys = self.keys.lock().await;
        let matching: Vec<String> = keys
            .iter()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        let mut deleted = 0;
        for key in matching {
            if self.entries.remove(&key).await.is_some() {
                deleted += 1;
            }
            keys.remove(&key);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn incr_counts_from_one() {
        // arrange
        let cache = MemoryCache::new();

        // act
        let first = cache.incr("POSTS:10.0.0.1", Duration::from_secs(60)).await.unwrap();
        let second = cache.incr("POSTS:10.0.0.1", Duration::from_secs(60)).await.unwrap();

        // assert
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn incr_keeps_original_window() {
        // arrange
        let cache = MemoryCache::new();
        cache.incr("REQUESTS:a", Duration::from_millis(50)).await.unwrap();

        // act
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.incr("REQUESTS:a", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // assert
        assert_eq!(cache.get("REQUESTS:a").await.unwrap(), None);
    }

    #[tokio::test]
    #[traced_test]
    async fn concurrent_increments_are_not_lost() {
        // arrange
        let cache = MemoryCache::new();

        // act
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache.incr("REQUESTS:burst", Duration::from_secs(5)).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // assert
        assert_eq!(cache.get("REQUESTS:burst").await.unwrap(), Some("50".to_string()));
    }

    #[tokio::test]
    #[traced_test]
    async fn add_only_when_absent() {
        // arrange
        let cache = MemoryCache::new();

        // act
        let first = cache.add("SEEN:a", "1", None).await.unwrap();
        let second = cache.add("SEEN:a", "2", None).await.unwrap();

        // assert
        assert!(first);
        assert!(!second);
        assert_eq!(cache.get("SEEN:a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_prefix_only_touches_namespace() {
        // arrange
        let cache = MemoryCache::new();
        cache.set("PARAMETER:A", "1", None).await.unwrap();
        cache.set("PARAMETER:B", "2", None).await.unwrap();
        cache.set("USER:s1", "{}", None).await.unwrap();

        // act
        let deleted = cache.delete_prefix("PARAMETER:").await.unwrap();

        // assert
        assert_eq!(deleted, 2);
        assert!(!cache.exists("PARAMETER:A").await.unwrap());
        assert!(cache.exists("USER:s1").await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn purge_forgets_expired_keys() {
        // arrange
        let cache = MemoryCache::new();
        for i in 0..200 {
            let ip = format!("10.1.{}.{}", i / 250, i % 250);
            cache.incr(&format!("REQUESTS:{ip}"), Duration::from_millis(5)).await.unwrap();
            cache.add(&format!("SEEN:{ip}"), "1", Some(Duration::from_millis(5))).await.unwrap();
        }
        cache.set("USER:s1", "{}", None).await.unwrap();

        // act
        tokio::time::sleep(Duration::from_millis(20)).await;
        let purged = cache.purge().await;

        // assert
        assert_eq!(purged, 400);
        assert_eq!(cache.keys.lock().await.len(), 1);
        assert!(cache.exists("USER:s1").await.unwrap());
    }

    #[tokio::test]
    #[traced_test]
    async fn monitor_sweeps_in_the_background() {
        // arrange
        let cache = MemoryCache::new();
        cache.incr("POSTS:10.0.0.1", Duration::from_millis(5)).await.unwrap();
        let monitored = cache.clone();
        let monitor = tokio::spawn(async move { monitored.monitor(Duration::from_millis(10)).await });

        // act
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.abort();

        // assert
        assert!(cache.keys.lock().await.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn incr_rejects_non_counters() {
        // arrange
        let cache = MemoryCache::new();
        cache.set("USER:s1", "{}", None).await.unwrap();

        // act
        let res = cache.incr("USER:s1", Duration::from_secs(1)).await;

        // assert
        assert!(matches!(res, Err(CacheError::NotACounter { .. })));
    }
}
