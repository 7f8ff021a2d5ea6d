//! In-memory implementation of the deferred queue and fleet registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::store::*;

type ClaimHook = Box<dyn FnOnce(&InMemoryDurableStore, &[Uuid]) + Send>;

struct QueuedTask {
    task: DeferredTask,
    seq: u64,
}

/// In-memory implementation of [`DeferredQueue`] and [`FleetRegistry`]
///
/// This is primarily for testing. It provides the same semantics as the
/// PostgreSQL implementation: priority ordering, claims that skip rows
/// removed by someone else, and all-or-nothing retirement.
///
/// # Example
///
/// ```
/// use repocrawl_durable::{InMemoryDurableStore, KindPriority};
///
/// let store = InMemoryDurableStore::new(KindPriority::new(["fast", "slow"]));
/// assert_eq!(store.deferred_count(), 0);
/// ```
pub struct InMemoryDurableStore {
    priority: KindPriority,
    deferred: RwLock<HashMap<Uuid, QueuedTask>>,
    workers: RwLock<HashMap<String, chrono::DateTime<Utc>>>,
    seq: AtomicU64,
    unavailable: AtomicBool,
    claim_hook: Mutex<Option<ClaimHook>>,
}

impl InMemoryDurableStore {
    /// Create a new in-memory store
    pub fn new(priority: KindPriority) -> Self {
        Self {
            priority,
            deferred: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            claim_hook: Mutex::new(None),
        }
    }

    /// Number of deferred tasks
    pub fn deferred_count(&self) -> usize {
        self.deferred.read().len()
    }

    /// Snapshot of deferred tasks in claim order
    pub fn deferred_tasks(&self) -> Vec<DeferredTask> {
        let deferred = self.deferred.read();
        let mut queued: Vec<&QueuedTask> = deferred.values().collect();
        queued.sort_by_key(|q| (self.priority.rank(&q.task.kind), q.seq));
        queued.into_iter().map(|q| q.task.clone()).collect()
    }

    /// Ids of registered workers
    pub fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a deferred task directly, as a competing worker would
    pub fn remove_deferred(&self, id: Uuid) -> bool {
        self.deferred.write().remove(&id).is_some()
    }

    /// Make every operation fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Run `hook` once between selecting and removing rows in the next claim
    ///
    /// Lets tests interleave a competing claimer deterministically.
    pub fn interleave_next_claim(
        &self,
        hook: impl FnOnce(&InMemoryDurableStore, &[Uuid]) + Send + 'static,
    ) {
        *self.claim_hook.lock() = Some(Box::new(hook));
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    fn insert(&self, deferred: &mut HashMap<Uuid, QueuedTask>, task: DeferredTask) {
        match deferred.get_mut(&task.id) {
            Some(existing) => {
                existing.task.kind = task.kind;
                existing.task.payload = task.payload;
            }
            None => {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                deferred.insert(task.id, QueuedTask { task, seq });
            }
        }
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new(KindPriority::default())
    }
}

#[async_trait]
impl DeferredQueue for InMemoryDurableStore {
    async fn enqueue(&self, task: DeferredTask) -> Result<(), StoreError> {
        self.check_available()?;
        let mut deferred = self.deferred.write();
        self.insert(&mut deferred, task);
        Ok(())
    }

    async fn enqueue_batch(&self, tasks: Vec<DeferredTask>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut deferred = self.deferred.write();
        for task in tasks {
            self.insert(&mut deferred, task);
        }
        Ok(())
    }

    async fn dequeue_up_to(&self, max: usize) -> Result<Vec<DeferredTask>, StoreError> {
        self.check_available()?;

        let selected: Vec<Uuid> = self
            .deferred_tasks()
            .into_iter()
            .take(max)
            .map(|t| t.id)
            .collect();

        let hook = self.claim_hook.lock().take();
        if let Some(hook) = hook {
            hook(self, &selected);
        }

        let mut deferred = self.deferred.write();
        Ok(selected
            .iter()
            .filter_map(|id| deferred.remove(id))
            .map(|q| q.task)
            .collect())
    }

    async fn backlog(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.deferred.read().len() as u64)
    }
}

#[async_trait]
impl FleetRegistry for InMemoryDurableStore {
    async fn register_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.workers
            .write()
            .entry(worker_id.to_string())
            .or_insert_with(Utc::now);
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.workers.write().remove(worker_id);
        Ok(())
    }

    async fn fleet_size(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.workers.read().len() as u64)
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>, StoreError> {
        self.check_available()?;
        let mut workers: Vec<WorkerRegistration> = self
            .workers
            .read()
            .iter()
            .map(|(id, at)| WorkerRegistration {
                worker_id: id.clone(),
                registered_at: *at,
            })
            .collect();
        workers.sort_by(|a, b| (a.registered_at, &a.worker_id).cmp(&(b.registered_at, &b.worker_id)));
        Ok(workers)
    }

    async fn retire_worker(
        &self,
        worker_id: &str,
        planner: &dyn LaunchPlanner,
    ) -> Result<RetireOutcome, FleetError> {
        self.check_available()?;

        let snapshot = FleetSnapshot {
            backlog: self.deferred.read().len() as u64,
            fleet_size: self.workers.read().len() as u64,
        };

        // Launches run without holding locks; registrations are applied only
        // once every launch succeeded.
        let count = planner.plan(snapshot);
        let mut launched = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let successor = Uuid::now_v7().to_string();
            planner.launch(&successor).await?;
            launched.push(successor);
        }

        self.check_available()?;
        let mut workers = self.workers.write();
        workers.remove(worker_id);
        let now = Utc::now();
        for id in &launched {
            workers.insert(id.clone(), now);
        }

        Ok(RetireOutcome { snapshot, launched })
    }
}
