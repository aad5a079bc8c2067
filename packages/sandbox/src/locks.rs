// ABOUTME: Per-sandbox mutual exclusion shared by the API mutation path and the reconciler
// ABOUTME: One async mutex per sandbox id, so unrelated sandboxes never wait on each other

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Entries are pruned once the map grows past this many ids
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct SandboxLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SandboxLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. Released when the guard drops.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            if map.len() >= PRUNE_THRESHOLD {
                // nobody holds or waits on an entry whose only owner is the map
                map.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            map.entry(id.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let locks = Arc::new(SandboxLocks::new());
        let guard = locks.lock("sbx-a").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("sbx-a").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_ids_are_independent() {
        let locks = SandboxLocks::new();
        let _a = locks.lock("sbx-a").await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.lock("sbx-b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len().await, 2);
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = SandboxLocks::new();
        for i in 0..PRUNE_THRESHOLD {
            drop(locks.lock(&format!("sbx-{}", i)).await);
        }
        let _held = locks.lock("sbx-held").await;
        // the map was full of idle entries, so only the new one remains
        assert_eq!(locks.len().await, 1);
    }
}
