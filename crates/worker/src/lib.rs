//! Repository crawler worker
//!
//! Crawls public repositories and their commit histories under a fixed call
//! budget. Work the budget cannot cover is parked in the shared deferred queue
//! and picked up by successor workers.

pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod github;
pub mod handlers;
pub mod launcher;
pub mod records;
pub mod store;
pub mod task;
pub mod telemetry;
pub mod worker;

// Re-export main types
pub use audit::{AuditEvent, AuditLog};
pub use config::{ConfigError, WorkerConfig};
pub use dispatcher::{DispatchStats, Dispatcher, Origin};
pub use github::{ApiError, GithubClient, InMemoryRepositoryApi, RepositoryApi};
pub use handlers::{CrawlError, CrawlLimits};
pub use launcher::{launcher_for, DryRunLauncher, LaunchRequest, WebhookLauncher};
pub use records::{CommitRecord, RepoRecord, TestChurn};
pub use store::{CrawlStore, CrawlStoreError, InMemoryCrawlStore, PostgresCrawlStore};
pub use task::{CrawlStep, CrawlTask, TaskKind};
pub use worker::{CrawlWorker, RunSummary, ShutdownReport, WorkerError, WorkerParts};
