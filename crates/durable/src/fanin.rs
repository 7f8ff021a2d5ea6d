//! Fan-in completion tracking
//!
//! A parent registers an expectation for each child it emits and later
//! waits on all of them at once. Children resolve their own entry by
//! correlation id when they finish, in any order.

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Receiving side of one expected completion
#[derive(Debug)]
pub struct CompletionSignal {
    id: Uuid,
    rx: oneshot::Receiver<()>,
}

impl CompletionSignal {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the completion. Returns `false` if it was abandoned.
    pub async fn wait(self) -> bool {
        self.rx.await.is_ok()
    }
}

/// Concurrent map from correlation id to pending completion
#[derive(Debug, Default)]
pub struct CompletionTracker {
    pending: DashMap<Uuid, oneshot::Sender<()>>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the completion of `id`
    ///
    /// Registering the same id again replaces the earlier expectation, which
    /// then resolves as abandoned.
    pub fn expect(&self, id: Uuid) -> CompletionSignal {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        CompletionSignal { id, rx }
    }

    /// Resolve the completion of `id`
    ///
    /// Returns `false` when nobody was waiting for it.
    pub fn complete(&self, id: Uuid) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Drop the expectation for `id` without completing it
    pub fn abandon(&self, id: Uuid) {
        self.pending.remove(&id);
    }

    /// Number of completions not yet resolved
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Outcome of waiting on a set of completions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanInReport {
    pub completed: usize,
    pub abandoned: usize,
}

/// A set of completions awaited together
#[derive(Default)]
pub struct FanIn {
    signals: Vec<CompletionSignal>,
}

impl FanIn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, signal: CompletionSignal) {
        self.signals.push(signal);
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Wait for every signal, in whatever order they resolve
    pub async fn wait_all(self) -> FanInReport {
        let mut pending: FuturesUnordered<_> =
            self.signals.into_iter().map(CompletionSignal::wait).collect();

        let mut report = FanInReport::default();
        while let Some(done) = pending.next().await {
            if done {
                report.completed += 1;
            } else {
                report.abandoned += 1;
            }
        }
        report
    }
}
