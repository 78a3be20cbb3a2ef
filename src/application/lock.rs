//! Mutual exclusion for encoder starts.

use crate::domain::segments::OutputTarget;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held while a start decision is made and carried out. Dropping it lets
/// the next waiter in.
pub struct StartPermit {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
pub trait StartExclusion: Send + Sync {
    async fn acquire(&self, target: &OutputTarget) -> StartPermit;
}

/// One lock for every target: starts are fully serialized.
#[derive(Default)]
pub struct GlobalStartLock {
    lock: Arc<AsyncMutex<()>>,
}

impl GlobalStartLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StartExclusion for GlobalStartLock {
    async fn acquire(&self, _target: &OutputTarget) -> StartPermit {
        StartPermit {
            _guard: self.lock.clone().lock_owned().await,
        }
    }
}

/// One lock per target, so starts for unrelated streams run in parallel.
#[derive(Default)]
pub struct KeyedStartLock {
    locks: Mutex<HashMap<OutputTarget, Arc<AsyncMutex<()>>>>,
}

impl KeyedStartLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, target: &OutputTarget) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        // Entries nobody else references are idle; drop them while here.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(target.clone()).or_default().clone()
    }
}

#[async_trait]
impl StartExclusion for KeyedStartLock {
    async fn acquire(&self, target: &OutputTarget) -> StartPermit {
        let lock = self.lock_for(target);
        StartPermit {
            _guard: lock.lock_owned().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_global_lock_serializes_targets() {
        let lock = GlobalStartLock::new();
        let _held = lock.acquire(&OutputTarget::new("/t/a.m3u8")).await;

        let other = tokio::time::timeout(
            Duration::from_millis(50),
            lock.acquire(&OutputTarget::new("/t/b.m3u8")),
        )
        .await;
        assert!(other.is_err());
    }

    #[tokio::test]
    async fn test_global_lock_released_on_drop() {
        let lock = GlobalStartLock::new();
        let held = lock.acquire(&OutputTarget::new("/t/a.m3u8")).await;
        drop(held);

        let again = tokio::time::timeout(
            Duration::from_millis(50),
            lock.acquire(&OutputTarget::new("/t/a.m3u8")),
        )
        .await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_keyed_lock_isolates_targets() {
        let lock = KeyedStartLock::new();
        let a = OutputTarget::new("/t/a.m3u8");
        let _held = lock.acquire(&a).await;

        let other = tokio::time::timeout(
            Duration::from_millis(50),
            lock.acquire(&OutputTarget::new("/t/b.m3u8")),
        )
        .await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), lock.acquire(&a)).await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn test_keyed_lock_forgets_idle_targets() {
        let lock = KeyedStartLock::new();
        drop(lock.acquire(&OutputTarget::new("/t/a.m3u8")).await);
        drop(lock.acquire(&OutputTarget::new("/t/b.m3u8")).await);
        assert_eq!(lock.locks.lock().len(), 1);
    }
}
