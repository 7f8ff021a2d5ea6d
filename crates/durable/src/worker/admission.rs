//! Budget-based admission control
//!
//! A worker may spend a fixed number of upstream calls. Every task costs one
//! unit; tasks that arrive once the budget is gone are parked in the
//! deferred queue for another worker.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::persistence::{Deferrable, DeferredQueue, StoreError};
use crate::reliability::RetryPolicy;

/// Outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the task now
    Admitted,

    /// The task was persisted to the deferred queue
    Deferred,
}

/// Result of admitting a batch
#[derive(Debug)]
pub struct BatchAdmission<T> {
    /// Tasks to run now, in input order
    pub admitted: Vec<T>,

    /// Number of tasks persisted to the deferred queue
    pub deferred: usize,

    /// Tasks over budget that could not be persisted; the caller owns them
    pub unpersisted: Vec<T>,

    /// Why `unpersisted` is non-empty
    pub error: Option<StoreError>,
}

/// Per-process admission gate
///
/// Holds the remaining budget as a signed counter. Each attempt decrements
/// it exactly once with a single atomic `fetch_sub`; the value seen before
/// the decrement decides the outcome, so concurrent attempts can never
/// admit more tasks than the budget allowed.
pub struct AdmissionGate {
    budget: AtomicI64,
    queue: Arc<dyn DeferredQueue>,
    retry: RetryPolicy,
    admitted: AtomicU64,
    deferred: AtomicU64,
}

impl AdmissionGate {
    /// Create a gate with an initial budget
    pub fn new(queue: Arc<dyn DeferredQueue>, budget: i64) -> Self {
        Self {
            budget: AtomicI64::new(budget),
            queue,
            retry: RetryPolicy::exponential(),
            admitted: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        }
    }

    /// Set the retry policy used for deferral writes
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Remaining budget (negative once over-asked)
    pub fn remaining(&self) -> i64 {
        self.budget.load(Ordering::SeqCst)
    }

    /// Whether the next attempt would be admitted
    pub fn has_budget(&self) -> bool {
        self.remaining() > 0
    }

    /// Drop the budget to zero. Never raises it.
    pub fn exhaust(&self) {
        if let Ok(previous) = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| (b > 0).then_some(0))
        {
            debug!(previous, "admission budget exhausted");
        }
    }

    /// Total tasks admitted so far
    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Total tasks deferred so far
    pub fn deferred_count(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    fn take_unit(&self) -> bool {
        self.budget.fetch_sub(1, Ordering::SeqCst) > 0
    }

    /// Admit one task or defer it
    ///
    /// On `Err` the task could not be persisted after retries; the caller
    /// still owns it and must report it.
    pub async fn try_admit<T: Deferrable + Sync>(&self, task: &T) -> Result<Admission, StoreError> {
        if self.take_unit() {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(Admission::Admitted);
        }

        let row = task.to_deferred()?;
        self.retry
            .run("enqueue", || self.queue.enqueue(row.clone()))
            .await?;

        self.deferred.fetch_add(1, Ordering::Relaxed);
        debug!(id = %row.id, kind = %row.kind, "task deferred by admission gate");
        Ok(Admission::Deferred)
    }

    /// Admit a batch, persisting every deferred member in one transaction
    ///
    /// The admitted half is always returned. When the deferral write fails
    /// the over-budget tasks come back in `unpersisted` with the error, so
    /// the caller still owns every task it passed in.
    pub async fn admit_batch<T: Deferrable + Sync>(&self, tasks: Vec<T>) -> BatchAdmission<T> {
        let mut admitted = Vec::new();
        let mut parked = Vec::new();
        let mut rows = Vec::new();
        let mut unpersisted = Vec::new();
        let mut error = None;

        for task in tasks {
            if self.take_unit() {
                admitted.push(task);
                continue;
            }
            match task.to_deferred() {
                Ok(row) => {
                    rows.push(row);
                    parked.push(task);
                }
                Err(e) => {
                    error.get_or_insert(e);
                    unpersisted.push(task);
                }
            }
        }

        let mut deferred = 0;
        if !rows.is_empty() {
            match self
                .retry
                .run("enqueue_batch", || self.queue.enqueue_batch(rows.clone()))
                .await
            {
                Ok(()) => deferred = rows.len(),
                Err(e) => {
                    error = Some(e);
                    unpersisted.append(&mut parked);
                }
            }
        }

        self.admitted
            .fetch_add(admitted.len() as u64, Ordering::Relaxed);
        self.deferred.fetch_add(deferred as u64, Ordering::Relaxed);

        BatchAdmission {
            admitted,
            deferred,
            unpersisted,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryDurableStore, KindPriority};
    use serde::Serialize;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize)]
    struct Job {
        id: Uuid,
    }

    impl Job {
        fn new() -> Self {
            Self { id: Uuid::now_v7() }
        }
    }

    impl Deferrable for Job {
        fn correlation_id(&self) -> Uuid {
            self.id
        }

        fn kind(&self) -> &'static str {
            "job"
        }
    }

    fn gate(budget: i64) -> (Arc<InMemoryDurableStore>, AdmissionGate) {
        let store = Arc::new(InMemoryDurableStore::new(KindPriority::new(["job"])));
        let gate = AdmissionGate::new(store.clone(), budget)
            .with_retry_policy(RetryPolicy::no_retry());
        (store, gate)
    }

    #[tokio::test]
    async fn test_zero_budget_defers() {
        let (store, gate) = gate(0);
        let job = Job::new();

        assert_eq!(gate.try_admit(&job).await.unwrap(), Admission::Deferred);
        assert_eq!(store.deferred_tasks()[0].id, job.id);
        assert_eq!(gate.remaining(), -1);
    }

    #[tokio::test]
    async fn test_budget_admits_exactly_that_many() {
        let (store, gate) = gate(3);

        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(gate.try_admit(&Job::new()).await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                Admission::Admitted,
                Admission::Admitted,
                Admission::Admitted,
                Admission::Deferred,
                Admission::Deferred,
            ]
        );
        assert_eq!(store.deferred_count(), 2);
        assert_eq!(gate.admitted_count(), 3);
        assert_eq!(gate.deferred_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_never_overspends() {
        let (store, gate) = gate(50);
        let gate = Arc::new(gate);

        let mut handles = Vec::new();
        for _ in 0..200 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.try_admit(&Job::new()).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() == Admission::Admitted {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 50);
        assert_eq!(store.deferred_count(), 150);
    }

    #[tokio::test]
    async fn test_exhaust_never_raises_budget() {
        let (_store, five) = gate(5);
        five.exhaust();
        assert_eq!(five.remaining(), 0);

        let (_store, gate) = gate(-2);
        gate.exhaust();
        assert_eq!(gate.remaining(), -2);
    }

    #[tokio::test]
    async fn test_batch_splits_at_budget() {
        let (store, gate) = gate(2);
        let jobs: Vec<Job> = (0..5).map(|_| Job::new()).collect();
        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();

        let batch = gate.admit_batch(jobs).await;

        assert_eq!(
            batch.admitted.iter().map(|j| j.id).collect::<Vec<_>>(),
            ids[..2].to_vec()
        );
        assert_eq!(batch.deferred, 3);
        assert!(batch.unpersisted.is_empty());
        assert!(batch.error.is_none());
        assert_eq!(store.deferred_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_batch_deferral_keeps_admitted_half() {
        let (store, gate) = gate(1);
        store.set_unavailable(true);
        let jobs: Vec<Job> = (0..3).map(|_| Job::new()).collect();
        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();

        let batch = gate.admit_batch(jobs).await;

        assert_eq!(
            batch.admitted.iter().map(|j| j.id).collect::<Vec<_>>(),
            ids[..1].to_vec()
        );
        assert_eq!(
            batch.unpersisted.iter().map(|j| j.id).collect::<Vec<_>>(),
            ids[1..].to_vec()
        );
        assert!(matches!(batch.error, Some(StoreError::Unavailable)));
        assert_eq!(batch.deferred, 0);
        assert_eq!(gate.admitted_count(), 1);
        assert_eq!(gate.deferred_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_deferral_is_reported() {
        let (store, gate) = gate(0);
        store.set_unavailable(true);

        let err = gate.try_admit(&Job::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable));
        assert_eq!(gate.deferred_count(), 0);
    }
}
