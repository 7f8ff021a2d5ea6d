//! Task dispatch
//!
//! The dispatcher owns the in-process half of a crawl: every task passes the
//! admission gate, admitted tasks run as spawned futures, and each one waits
//! for its children before reporting its own completion. Deferred tasks
//! complete as soon as their row is committed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use repocrawl_durable::{
    Admission, AdmissionGate, CompletionSignal, CompletionTracker, Deferrable, DeferredQueue,
    FanIn, RetryPolicy,
};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::github::RepositoryApi;
use crate::handlers::{self, CrawlLimits, HandlerContext};
use crate::store::CrawlStore;
use crate::task::CrawlTask;

/// Where a task came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Bootstrap task of an initial crawl
    Seed,
    /// Emitted by a running task
    Spawned,
    /// Claimed from the deferred queue
    Queue,
}

impl Origin {
    pub fn from_queue(&self) -> bool {
        matches!(self, Origin::Queue)
    }
}

/// Counters describing what the dispatcher has done
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub succeeded: u64,
    pub failed: u64,
    pub redeferred: u64,
    /// Rows claimed from the deferred queue
    pub drained: u64,
    /// Claimed rows that could not be decoded and were dropped
    pub undecodable: u64,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    redeferred: AtomicU64,
    drained: AtomicU64,
    undecodable: AtomicU64,
}

/// Runs crawl tasks under the admission gate
pub struct Dispatcher {
    gate: Arc<AdmissionGate>,
    queue: Arc<dyn DeferredQueue>,
    api: Arc<dyn RepositoryApi>,
    store: Arc<dyn CrawlStore>,
    audit: AuditLog,
    limits: CrawlLimits,
    retry: RetryPolicy,
    tracker: CompletionTracker,
    in_flight: AtomicUsize,
    activity: Notify,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(
        gate: Arc<AdmissionGate>,
        queue: Arc<dyn DeferredQueue>,
        api: Arc<dyn RepositoryApi>,
        store: Arc<dyn CrawlStore>,
        audit: AuditLog,
        limits: CrawlLimits,
    ) -> Self {
        Self {
            gate,
            queue,
            api,
            store,
            audit,
            limits,
            retry: RetryPolicy::exponential(),
            tracker: CompletionTracker::new(),
            in_flight: AtomicUsize::new(0),
            activity: Notify::new(),
            counters: Counters::default(),
        }
    }

    /// Set the retry policy used when re-deferring failed tasks
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Tasks admitted in this process that have not finished yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Completions still awaited by some parent
    pub fn pending_completions(&self) -> usize {
        self.tracker.outstanding()
    }

    /// Resolves after the next task finishes
    ///
    /// A finish that happens while nobody is waiting is remembered, so a
    /// caller that checks [`in_flight`](Self::in_flight) first never misses it.
    pub fn activity(&self) -> Notified<'_> {
        self.activity.notified()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            redeferred: self.counters.redeferred.load(Ordering::Relaxed),
            drained: self.counters.drained.load(Ordering::Relaxed),
            undecodable: self.counters.undecodable.load(Ordering::Relaxed),
        }
    }

    /// Admit or defer one task
    ///
    /// The returned signal resolves when the task, and everything it emitted,
    /// has finished here or has been committed to the deferred queue.
    pub async fn submit(self: &Arc<Self>, task: CrawlTask, origin: Origin) -> CompletionSignal {
        let signal = self.tracker.expect(task.id());

        match self.gate.try_admit(&task).await {
            Ok(Admission::Admitted) => self.spawn(task, origin),
            Ok(Admission::Deferred) => {
                self.audit
                    .record_task(&task, AuditEvent::Deferred, None, origin.from_queue())
                    .await;
                self.tracker.complete(task.id());
            }
            Err(e) => {
                lost(&task, "failed to defer task", &e);
                self.tracker.complete(task.id());
            }
        }

        signal
    }

    /// Claim up to `max` deferred tasks and admit them
    ///
    /// Returns the number of rows claimed. A failed claim is logged and
    /// counts as an empty queue.
    pub async fn refill(self: &Arc<Self>, max: usize) -> usize {
        if max == 0 {
            return 0;
        }

        let rows = match self.queue.dequeue_up_to(max).await {
            Ok(rows) => {
                self.audit.record_dequeue(max, rows.len(), None).await;
                rows
            }
            Err(e) => {
                error!(error = %e, asked = max, "failed to claim deferred tasks");
                self.audit
                    .record_dequeue(max, 0, Some(&e.to_string()))
                    .await;
                return 0;
            }
        };

        let claimed = rows.len();
        self.counters
            .drained
            .fetch_add(claimed as u64, Ordering::Relaxed);

        let mut tasks = Vec::with_capacity(claimed);
        for row in rows {
            match row.decode::<CrawlTask>() {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    self.counters.undecodable.fetch_add(1, Ordering::Relaxed);
                    error!(
                        id = %row.id,
                        kind = %row.kind,
                        payload = %row.payload,
                        error = %e,
                        "dropping undecodable deferred task"
                    );
                }
            }
        }

        let batch = self.gate.admit_batch(tasks).await;
        debug!(
            claimed,
            admitted = batch.admitted.len(),
            deferred = batch.deferred,
            unpersisted = batch.unpersisted.len(),
            "refilled from deferred queue"
        );
        for task in batch.admitted {
            self.spawn(task, Origin::Queue);
        }
        if let Some(e) = &batch.error {
            for task in &batch.unpersisted {
                lost(task, "failed to return claimed task to the queue", e);
            }
        }

        claimed
    }

    fn spawn(self: &Arc<Self>, task: CrawlTask, origin: Origin) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(Arc::clone(self).execute(task, origin));
    }

    fn execute(self: Arc<Self>, task: CrawlTask, origin: Origin) -> BoxFuture<'static, ()> {
        async move {
            let from_queue = origin.from_queue();
            let ctx = HandlerContext {
                api: self.api.as_ref(),
                store: self.store.as_ref(),
                limits: self.limits,
            };

            let mut children = FanIn::new();
            match handlers::run(&ctx, task.step()).await {
                Ok(steps) => {
                    for step in steps {
                        children.push(self.submit(CrawlTask::new(step), Origin::Spawned).await);
                    }
                    self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        id = %task.id(),
                        kind = %task.task_kind(),
                        children = children.len(),
                        "task completed"
                    );
                    self.audit
                        .record_task(&task, AuditEvent::Completed, None, from_queue)
                        .await;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        id = %task.id(),
                        kind = %task.task_kind(),
                        error = %e,
                        "upstream unreachable, deferring task"
                    );
                    self.redefer(&task).await;
                    self.audit
                        .record_task(&task, AuditEvent::Redeferred, Some(&e.to_string()), from_queue)
                        .await;
                }
                Err(e) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        id = %task.id(),
                        kind = %task.task_kind(),
                        error = %e,
                        "task failed"
                    );
                    self.audit
                        .record_task(&task, AuditEvent::Failed, Some(&e.to_string()), from_queue)
                        .await;
                }
            }

            let report = children.wait_all().await;
            if report.abandoned > 0 {
                warn!(id = %task.id(), abandoned = report.abandoned, "children abandoned");
            }

            self.tracker.complete(task.id());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.activity.notify_one();
        }
        .boxed()
    }

    /// Put a task back in the queue under its own id
    async fn redefer(&self, task: &CrawlTask) {
        let row = match task.to_deferred() {
            Ok(row) => row,
            Err(e) => {
                lost(task, "failed to encode task for redeferral", &e);
                return;
            }
        };

        match self
            .retry
            .run("redefer", || self.queue.enqueue(row.clone()))
            .await
        {
            Ok(()) => {
                self.counters.redeferred.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => lost(task, "failed to redefer task", &e),
        }
    }
}

/// Log a task that could not be persisted, with everything needed to replay it
fn lost(task: &CrawlTask, message: &str, error: &dyn std::error::Error) {
    let payload = serde_json::to_string(task).unwrap_or_default();
    error!(
        id = %task.id(),
        kind = %task.task_kind(),
        error = %error,
        payload = %payload,
        "{message}"
    );
}

/// Log line for a finished run
pub fn log_stats(stats: &DispatchStats) {
    info!(
        succeeded = stats.succeeded,
        failed = stats.failed,
        redeferred = stats.redeferred,
        drained = stats.drained,
        undecodable = stats.undecodable,
        "dispatch finished"
    );
}
