//! Outstanding-write tracking for graceful shutdown
//!
//! The connection pool must outlive every write issued on it. Writers hold a
//! [`WriteGuard`] for the duration of a write and shutdown waits until none
//! remain before closing the pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    outstanding: AtomicUsize,
    idle: Notify,
}

/// Counts writes in flight
#[derive(Clone, Default)]
pub struct WriteTracker {
    inner: Arc<Inner>,
}

impl WriteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a write. The write ends when the guard drops.
    pub fn begin(&self) -> WriteGuard {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        WriteGuard {
            inner: self.inner.clone(),
        }
    }

    /// Number of writes in flight
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until no writes are in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held for the duration of one write
pub struct WriteGuard {
    inner: Arc<Inner>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
