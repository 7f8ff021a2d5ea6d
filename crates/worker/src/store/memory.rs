//! In-memory implementation of CrawlStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CrawlStore, CrawlStoreError};
use crate::records::{CommitRecord, RepoRecord};

/// In-memory implementation of [`CrawlStore`]
///
/// This is primarily for testing. Upserts replace by key exactly like the
/// PostgreSQL implementation.
#[derive(Default)]
pub struct InMemoryCrawlStore {
    repos: RwLock<HashMap<i64, RepoRecord>>,
    commits: RwLock<HashMap<String, CommitRecord>>,
}

impl InMemoryCrawlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repo(&self, id: i64) -> Option<RepoRecord> {
        self.repos.read().get(&id).cloned()
    }

    pub fn commit(&self, sha: &str) -> Option<CommitRecord> {
        self.commits.read().get(sha).cloned()
    }

    pub fn repo_count(&self) -> usize {
        self.repos.read().len()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.read().len()
    }
}

#[async_trait]
impl CrawlStore for InMemoryCrawlStore {
    async fn upsert_repo(&self, record: &RepoRecord) -> Result<(), CrawlStoreError> {
        self.repos.write().insert(record.id, record.clone());
        Ok(())
    }

    async fn upsert_commit(&self, record: &CommitRecord) -> Result<(), CrawlStoreError> {
        self.commits
            .write()
            .insert(record.sha.clone(), record.clone());
        Ok(())
    }
}
