//! Key-value cache with per-entry TTL.  The cache is the only thing webhook requests share, so
//! every stream, survey and conversation lives here under a namespaced key.

use crate::error::AppError;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
}

pub async fn get_json<T: DeserializeOwned>(
    cache: &dyn CacheStore,
    key: &str,
) -> Result<Option<T>, AppError> {
    match cache.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    cache: &dyn CacheStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), AppError> {
    let bytes = serde_json::to_vec(value)?;
    cache.put(key, bytes, ttl).await
}

pub mod keys {
    pub fn call(call_sid: &str) -> String {
        format!("call:{call_sid}")
    }

    pub fn conversation(call_sid: &str) -> String {
        format!("conv:{call_sid}")
    }

    pub fn survey(call_sid: &str) -> String {
        format!("survey:{call_sid}")
    }

    pub fn audio(audio_id: &str) -> String {
        format!("audio:{audio_id}")
    }
}

struct Entry {
    value: Vec<u8>,
    expires: Instant,
}

/// In-process cache.  Expired entries read as absent and are dropped lazily or by
/// `purge_expired`.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.expires > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match entries.get(key) {
            Some(entry) if entry.expires > Instant::now() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), AppError> {
        let expires = Instant::now() + ttl;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), Entry { value, expires });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        idx: u32,
        text: String,
    }

    #[tokio::test]
    async fn put_get_delete() {
        let cache = MemoryCache::new();
        cache
            .put("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let cache = MemoryCache::new();
        cache.put("gone", b"x".to_vec(), Duration::ZERO).await.unwrap();
        cache
            .put("kept", b"y".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("gone").await.unwrap(), None);
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn json_helpers() {
        let cache = MemoryCache::new();
        let sample = Sample {
            idx: 3,
            text: "hello".to_string(),
        };
        put_json(&cache, "s", &sample, Duration::from_secs(60))
            .await
            .unwrap();
        let back: Option<Sample> = get_json(&cache, "s").await.unwrap();
        assert_eq!(back, Some(sample));
        let missing: Option<Sample> = get_json(&cache, "nope").await.unwrap();
        assert!(missing.is_none());
    }
}
