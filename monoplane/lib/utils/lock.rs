use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A map of per-entity async locks.
///
/// Operations that touch the same key serialize, operations on different keys run concurrently.
/// Entries are dropped once nobody holds or waits on them.
#[derive(Debug, Default, Clone)]
pub struct EntityLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Holds the lock of one entity until dropped.
#[derive(Debug)]
pub struct EntityGuard {
    key: String,
    locks: EntityLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EntityLocks {
    /// Creates an empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for and acquires the lock of `key`.
    pub async fn lock(&self, key: impl Into<String>) -> EntityGuard {
        let key = key.into();
        let mutex = {
            let mut map = self.map();
            map.entry(key.clone()).or_default().clone()
        };

        let guard = mutex.lock_owned().await;
        EntityGuard {
            key,
            locks: self.clone(),
            guard: Some(guard),
        }
    }

    /// The number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    /// Whether no key is currently held or awaited.
    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EntityGuard {
    /// The key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for EntityGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut map = self.locks.map();
        if let Some(mutex) = map.get(&self.key) {
            // Only the map itself references the mutex: no holder, no waiter.
            if Arc::strong_count(mutex) == 1 {
                map.remove(&self.key);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_entity_locks_serialize_same_key() -> anyhow::Result<()> {
        let locks = EntityLocks::new();
        let guard = locks.lock("sandbox:a").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("sandbox:a").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender).await??;
        assert!(locks.is_empty());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_entity_locks_independent_keys() -> anyhow::Result<()> {
        let locks = EntityLocks::new();
        let _a = locks.lock("runner:a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("runner:b")).await?;

        assert_eq!(b.key(), "runner:b");
        assert_eq!(locks.len(), 2);

        Ok(())
    }
}
