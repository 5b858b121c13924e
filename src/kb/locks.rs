//! Per-collection locks
//! Serialises drop/recreate/delete on one collection owner, independent of the job queue

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

/// Async mutex per owner id, created on first use
#[derive(Default, Clone)]
pub struct OwnerLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `owner_id`'s collection
    pub async fn lock(&self, owner_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // Forget owners nobody is holding or waiting on
            locks.retain(|id, l| id == owner_id || Arc::strong_count(l) > 1);
            locks
                .entry(owner_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Owners with a live lock entry
    pub fn tracked(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_owner_is_exclusive() {
        let locks = OwnerLocks::new();
        let guard = locks.lock("kb1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("kb1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_owners_do_not_block() {
        let locks = OwnerLocks::new();
        let _a = locks.lock("kb1").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("note1")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = OwnerLocks::new();
        drop(locks.lock("a").await);
        drop(locks.lock("b").await);
        drop(locks.lock("c").await);
        assert_eq!(locks.tracked(), 1);
    }
}
