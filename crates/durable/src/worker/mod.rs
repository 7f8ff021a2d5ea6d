//! Per-process worker primitives
//!
//! This module provides:
//! - [`AdmissionGate`] - budget-based execute-now-or-defer decisions
//! - [`WriteTracker`] - outstanding-write accounting for shutdown

mod admission;
mod drain;

pub use admission::{Admission, AdmissionGate, BatchAdmission};
pub use drain::{WriteGuard, WriteTracker};
