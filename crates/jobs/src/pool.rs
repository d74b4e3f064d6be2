//! Bounded pool for per-connection session tasks.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::JobError;

/// Limits how many session loops run at once across all jobs.
///
/// Scheduling fails fast instead of queueing, so a saturated node refuses
/// new connections rather than letting them stall.
#[derive(Clone)]
pub struct SessionPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl SessionPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Reserves a slot without spawning anything yet.
    ///
    /// Lets the caller refuse a session to its peer while it still owns it.
    pub fn try_acquire(&self) -> Result<SessionSlot, JobError> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| JobError::PoolRejected)?;
        Ok(SessionSlot { permit })
    }

    /// Spawns `fut` if a slot is free. The slot is held until the task ends.
    pub fn try_spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>, JobError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.try_acquire()?.spawn(fut))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A reserved pool slot. Dropping it unused gives the slot back.
pub struct SessionSlot {
    permit: OwnedSemaphorePermit,
}

impl SessionSlot {
    /// Runs `fut` on this slot, holding it until the task ends.
    pub fn spawn<F>(self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.permit;
        tokio::spawn(async move {
            let _permit = permit;
            fut.await
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn rejects_when_full_and_recovers() {
        let pool = SessionPool::new(1);
        let (tx, rx) = oneshot::channel::<()>();
        let first = pool.try_spawn(async move {
            let _ = rx.await;
        });
        assert!(first.is_ok());
        assert_eq!(pool.available(), 0);

        assert!(matches!(
            pool.try_spawn(async {}),
            Err(JobError::PoolRejected)
        ));

        tx.send(()).unwrap();
        first.unwrap().await.unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.try_spawn(async { 7 }).unwrap().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn unused_slot_is_returned() {
        let pool = SessionPool::new(1);
        let slot = pool.try_acquire().unwrap();
        assert!(matches!(pool.try_acquire(), Err(JobError::PoolRejected)));
        drop(slot);
        assert_eq!(pool.available(), 1);

        let slot = pool.try_acquire().unwrap();
        let handle = slot.spawn(async { 3 });
        assert_eq!(handle.await.unwrap(), 3);
        assert_eq!(pool.available(), 1);
    }
}
