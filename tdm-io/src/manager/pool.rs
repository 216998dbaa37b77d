//! Bounded I/O pool
//!
//! A fixed number of permits, one per concurrent write or load. Work runs as
//! tasks on the runtime captured at construction; a task holds its permit
//! only for the file operation itself.
//!
//! Phase operations never hold a permit while they wait on the tasks they
//! submit, so a phase cannot starve the pool of the permits it depends on.

use std::future::Future;
use std::sync::Arc;
use tdm_common::{Error, Result};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub(crate) struct IoPool {
    permits: Arc<Semaphore>,
    size: usize,
    runtime: Handle,
}

impl IoPool {
    /// Create a pool of `size` permits on the current runtime
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("I/O pool needs at least one worker".to_string()));
        }
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no tokio runtime for I/O pool: {}", e)))?;

        debug!("I/O pool created with {} workers", size);
        Ok(Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            runtime,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a free worker slot
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::ShutDown)
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(task)
    }

    /// Refuse further work; tasks waiting for a permit fail with `ShutDown`
    pub fn close(&self) {
        if !self.permits.is_closed() {
            self.permits.close();
            info!("I/O pool closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(IoPool::new(2), Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        assert!(matches!(IoPool::new(0), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_permits_bound_concurrency() {
        let pool = IoPool::new(2).unwrap();
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.permits.available_permits(), 0);
        drop(a);
        assert_eq!(pool.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let pool = Arc::new(IoPool::new(1).unwrap());
        let held = pool.acquire().await.unwrap();

        let p = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { p.acquire().await.map(|_| ()) });
        tokio::task::yield_now().await;

        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(Error::ShutDown)));
        drop(held);
        assert!(matches!(pool.acquire().await, Err(Error::ShutDown)));
    }
}
