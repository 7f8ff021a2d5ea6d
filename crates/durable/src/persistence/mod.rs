//! Persistence layer for deferred work and the worker fleet
//!
//! This module provides:
//! - [`DeferredQueue`] trait for the shared deferred-task queue
//! - [`FleetRegistry`] trait for the registry of running workers
//! - [`PostgresDurableStore`] for production
//! - [`InMemoryDurableStore`] for testing

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryDurableStore;
pub use postgres::PostgresDurableStore;
pub use store::{
    Deferrable, DeferredQueue, DeferredTask, FleetError, FleetRegistry, FleetSnapshot,
    KindPriority, LaunchError, LaunchPlanner, RetireOutcome, StoreError, WorkerRegistration,
};
