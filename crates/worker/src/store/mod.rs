//! Persistence of crawled records
//!
//! Both writes are upserts keyed by the natural id, so repeating a task is
//! harmless.

mod memory;
mod postgres;

use async_trait::async_trait;

use crate::records::{CommitRecord, RepoRecord};

pub use memory::InMemoryCrawlStore;
pub use postgres::PostgresCrawlStore;

/// Error type for record writes
#[derive(Debug, thiserror::Error)]
pub enum CrawlStoreError {
    #[error("database error: {0}")]
    Database(String),
}

/// Destination for crawled records
#[async_trait]
pub trait CrawlStore: Send + Sync + 'static {
    /// Insert or replace a repository by id
    async fn upsert_repo(&self, record: &RepoRecord) -> Result<(), CrawlStoreError>;

    /// Insert or replace a commit by sha
    async fn upsert_commit(&self, record: &CommitRecord) -> Result<(), CrawlStoreError>;
}
