use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Expiring key-value storage backing upload sessions, chunk payloads and
/// the parsed-workbook cache.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;
    /// Returns true when a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Drops expired entries; returns how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| e.expires_at > now))
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        Ok(before.saturating_sub(self.entries.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire() {
        let store = MemoryKvStore::new();
        store
            .set("a", Bytes::from_static(b"1"), Duration::from_millis(30))
            .await
            .unwrap();
        store
            .set("b", Bytes::from_static(b"2"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some(&b"1"[..]));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("a").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = MemoryKvStore::new();
        store
            .set("old", Bytes::from_static(b"x"), Duration::from_millis(1))
            .await
            .unwrap();
        store
            .set("new", Bytes::from_static(b"y"), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.delete("new").await.unwrap());
        assert!(!store.delete("new").await.unwrap());
    }
}
