//! # Durable Work Coordination
//!
//! A PostgreSQL-backed coordination layer for short-lived workers that share a
//! hard external call budget.
//!
//! ## Features
//!
//! - **Deferred queue**: work a worker cannot afford is parked in a shared table
//!   and claimed later in priority order, each row by exactly one worker
//! - **Admission gate**: a per-process budget decides execute-now or defer
//! - **Fan-in tracking**: a parent waits for all of its children by correlation id
//! - **Fleet registry**: running workers are registered so the fleet can size itself
//! - **Autoscaling**: a retiring worker launches successors in proportion to the
//!   backlog and the remaining fleet headroom
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      AdmissionGate                           │
//! │  (budget counter, defers into the queue when spent)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              DeferredQueue / FleetRegistry                   │
//! │  (PostgreSQL: deferred, executing)                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Autoscaler + WriteTracker                    │
//! │  (launch successors, drain writes, release the pool)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use repocrawl_durable::prelude::*;
//!
//! let store = Arc::new(PostgresDurableStore::new(pool, KindPriority::new(["a", "b"])));
//! let gate = AdmissionGate::new(store.clone(), remaining_calls);
//!
//! match gate.try_admit(&task).await? {
//!     Admission::Admitted => run(task).await,
//!     Admission::Deferred => {}
//! }
//! ```

pub mod autoscale;
pub mod fanin;
pub mod persistence;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::autoscale::{launch_count, Autoscaler, ComputeLauncher};
    pub use crate::fanin::{CompletionSignal, CompletionTracker, FanIn, FanInReport};
    pub use crate::persistence::{
        Deferrable, DeferredQueue, DeferredTask, FleetError, FleetRegistry, FleetSnapshot,
        InMemoryDurableStore, KindPriority, LaunchError, LaunchPlanner, PostgresDurableStore,
        RetireOutcome, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{Admission, AdmissionGate, WriteTracker};
}

// Re-export key types at crate root
pub use autoscale::{launch_count, launch_count_with, Autoscaler, ComputeLauncher};
pub use fanin::{CompletionSignal, CompletionTracker, FanIn, FanInReport};
pub use persistence::{
    Deferrable, DeferredQueue, DeferredTask, FleetError, FleetRegistry, FleetSnapshot,
    InMemoryDurableStore, KindPriority, LaunchError, LaunchPlanner, PostgresDurableStore,
    RetireOutcome, StoreError, WorkerRegistration,
};
pub use reliability::RetryPolicy;
pub use worker::{Admission, AdmissionGate, BatchAdmission, WriteGuard, WriteTracker};
