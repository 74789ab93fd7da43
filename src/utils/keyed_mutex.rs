use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key async lock. Upload sessions lock on their session key and jobs on
/// their id, so unrelated work never contends.
#[derive(Debug, Clone, Default)]
pub struct KeyedMutex {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`; released when the guard is dropped.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        mutex.lock_owned().await
    }

    /// Drops entries nobody holds or waits on. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before.saturating_sub(self.locks.len())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = KeyedMutex::new();
        let guard = locks.lock("job-1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("job-1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedMutex::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn cleanup_keeps_held_locks() {
        let locks = KeyedMutex::new();
        let held = locks.lock("held").await;
        drop(locks.lock("free").await);

        assert_eq!(locks.cleanup(), 1);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert_eq!(locks.cleanup(), 1);
        assert!(locks.is_empty());
    }
}
