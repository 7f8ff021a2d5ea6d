//! Crawl tasks
//!
//! A crawl is a tree of small steps. Each step is one upstream call and may
//! emit further steps. Every instance carries its own correlation id.

use std::fmt;

use repocrawl_durable::{Deferrable, KindPriority};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task kind names, as stored in the deferred queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ListRepos,
    FetchRepo,
    FetchLastPage,
    ListCommitsPage,
    FetchCommit,
}

impl TaskKind {
    /// Dequeue order: finish the deepest work first so that trees complete
    /// before new ones start.
    pub const PRIORITY: [TaskKind; 5] = [
        TaskKind::FetchCommit,
        TaskKind::ListCommitsPage,
        TaskKind::FetchLastPage,
        TaskKind::FetchRepo,
        TaskKind::ListRepos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ListRepos => "list_repos",
            TaskKind::FetchRepo => "fetch_repo",
            TaskKind::FetchLastPage => "fetch_last_page",
            TaskKind::ListCommitsPage => "list_commits_page",
            TaskKind::FetchCommit => "fetch_commit",
        }
    }

    /// Queue priority for crawl tasks
    pub fn queue_priority() -> KindPriority {
        KindPriority::new(Self::PRIORITY.iter().map(TaskKind::as_str))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrawlStep {
    /// List public repositories after the `since` cursor
    ListRepos { since: i64, repos_seen: u64 },

    /// Fetch one repository's metadata
    FetchRepo { owner: String, name: String },

    /// Find the last page of a repository's commit history
    FetchLastPage {
        repo_id: i64,
        owner: String,
        name: String,
    },

    /// List one page of commits, walking backward from the last page
    ListCommitsPage {
        repo_id: i64,
        owner: String,
        name: String,
        page: u32,
        commits_seen: u64,
    },

    /// Fetch one commit with its file stats
    FetchCommit {
        repo_id: i64,
        owner: String,
        name: String,
        sha: String,
    },
}

impl CrawlStep {
    pub fn kind(&self) -> TaskKind {
        match self {
            CrawlStep::ListRepos { .. } => TaskKind::ListRepos,
            CrawlStep::FetchRepo { .. } => TaskKind::FetchRepo,
            CrawlStep::FetchLastPage { .. } => TaskKind::FetchLastPage,
            CrawlStep::ListCommitsPage { .. } => TaskKind::ListCommitsPage,
            CrawlStep::FetchCommit { .. } => TaskKind::FetchCommit,
        }
    }
}

/// A step with its correlation id
///
/// Immutable once built; a task is either executed or deferred, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlTask {
    id: Uuid,
    #[serde(flatten)]
    step: CrawlStep,
}

impl CrawlTask {
    /// New task with a fresh correlation id
    pub fn new(step: CrawlStep) -> Self {
        Self {
            id: Uuid::now_v7(),
            step,
        }
    }

    /// Bootstrap task for an initial crawl
    pub fn bootstrap(since: i64) -> Self {
        Self::new(CrawlStep::ListRepos {
            since,
            repos_seen: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn step(&self) -> &CrawlStep {
        &self.step
    }

    pub fn task_kind(&self) -> TaskKind {
        self.step.kind()
    }
}

impl Deferrable for CrawlTask {
    fn correlation_id(&self) -> Uuid {
        self.id
    }

    fn kind(&self) -> &'static str {
        self.step.kind().as_str()
    }
}
