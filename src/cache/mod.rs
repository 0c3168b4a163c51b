//! Shared cache port.
//!
//! Every piece of cross-request state the defense pipeline keeps (counters,
//! block flags, cached parameters, session-bound users) lives behind this
//! trait. Workers may be separate processes, so counters must go through
//! [`Cache::incr`] rather than a read-modify-write of [`Cache::get`].

mod memory;
mod redis;

pub use memory::MemoryCache;
pub use redis::RedisCache;

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),
    #[error("cached value under {key} is not a counter: {value}")]
    NotACounter { key: String, value: String },
    #[error("cached value under {key} could not be decoded: {reason}")]
    Decode { key: String, reason: String },
}

impl From<::redis::RedisError> for CacheError {
    fn from(value: ::redis::RedisError) -> Self {
        tracing::error!(kind = "cache", error = %value);
        CacheError::Backend(value.to_string())
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// `ttl = None` keeps the entry until it is deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Stores the value only when the key is absent. Returns whether it did.
    async fn add(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, CacheError>;

    /// Atomically increments the counter under `key` and returns the new
    /// value. A missing counter starts at 1 and expires after `ttl`; an
    /// existing one keeps its original expiry.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Deletes every key starting with `prefix`. Returns how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Pushes the expiry of an existing key forward. No-op when absent.
    async fn touch(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        if let Some(value) = self.get(key).await? {
            self.set(key, &value, Some(ttl)).await?;
        }
        Ok(())
    }
}

/// Key builders for every namespace the pipeline writes.
pub mod keys {
    pub fn parameter(name: &str) -> String {
        format!("{}{}", PARAMETER_PREFIX, name)
    }

    pub fn requests(ip: &str) -> String {
        format!("REQUESTS:{}", ip)
    }

    pub fn posts(ip: &str) -> String {
        format!("POSTS:{}", ip)
    }

    pub fn donations(ip: &str) -> String {
        format!("DONATIONS:{}", ip)
    }

    pub fn member_forms(ip: &str) -> String {
        format!("MEMBER_FORMS:{}", ip)
    }

    pub fn seen(ip: &str) -> String {
        format!("SEEN:{}", ip)
    }

    pub fn blacklisted(ip: &str) -> String {
        format!("BLACKLISTED:{}", ip)
    }

    pub fn whitelisted(ip: &str) -> String {
        format!("{}{}", WHITELISTED_PREFIX, ip)
    }

    pub fn user(session_key: &str) -> String {
        format!("USER:{}", session_key)
    }

    pub fn exception(ip: &str, kind: &str) -> String {
        format!("EXCEPTION:{}:{}", ip, kind)
    }

    pub const PARAMETER_PREFIX: &str = "PARAMETER:";
    pub const WHITELISTED_PREFIX: &str = "WHITELISTED:";
}

/// Read a JSON document stored by [`set_json`].
pub async fn get_json<T>(cache: &dyn Cache, key: &str) -> Result<Option<T>, CacheError>
where
    T: serde::de::DeserializeOwned,
{
    match cache.get(key).await? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CacheError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

pub async fn set_json<T>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<(), CacheError>
where
    T: serde::Serialize + Sync,
{
    let raw = serde_json::to_string(value).map_err(|e| CacheError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    cache.set(key, &raw, ttl).await
}
