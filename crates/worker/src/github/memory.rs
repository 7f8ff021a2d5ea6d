//! Scripted in-memory repository API

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::client::{ApiError, RepositoryApi};
use super::types::*;

#[derive(Clone)]
enum Scripted {
    Repos(Page<RepoSummary>),
    Repo(RepoDetail),
    Commits(Page<CommitSummary>),
    Commit(CommitDetail),
    Unreachable,
    Status(u16),
}

/// In-memory implementation of [`RepositoryApi`]
///
/// This is primarily for testing. Responses are scripted per request path;
/// anything unscripted answers 404. Every call is recorded.
///
/// # Example
///
/// ```
/// use repocrawl_worker::github::{InMemoryRepositoryApi, Page};
///
/// let api = InMemoryRepositoryApi::new(100).with_repositories(0, Page::new(vec![]));
/// assert!(api.calls().is_empty());
/// ```
pub struct InMemoryRepositoryApi {
    remaining: i64,
    responses: RwLock<HashMap<String, Scripted>>,
    calls: RwLock<Vec<String>>,
}

impl InMemoryRepositoryApi {
    /// Create an API that reports `remaining` calls left
    pub fn new(remaining: i64) -> Self {
        Self {
            remaining,
            responses: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
        }
    }

    fn script(self, path: String, response: Scripted) -> Self {
        self.responses.write().insert(path, response);
        self
    }

    pub fn with_repositories(self, since: i64, page: Page<RepoSummary>) -> Self {
        self.script(listing_path(since), Scripted::Repos(page))
    }

    pub fn with_repository(self, owner: &str, name: &str, detail: RepoDetail) -> Self {
        self.script(repo_path(owner, name), Scripted::Repo(detail))
    }

    pub fn with_first_commits(self, owner: &str, name: &str, page: Page<CommitSummary>) -> Self {
        self.script(first_commits_path(owner, name), Scripted::Commits(page))
    }

    pub fn with_commits(self, repo_id: i64, page_no: u32, page: Page<CommitSummary>) -> Self {
        self.script(commits_path(repo_id, page_no), Scripted::Commits(page))
    }

    pub fn with_commit(self, owner: &str, name: &str, sha: &str, detail: CommitDetail) -> Self {
        self.script(commit_path(owner, name, sha), Scripted::Commit(detail))
    }

    /// Make a path fail as if the host could not be reached
    pub fn unreachable(self, path: &str) -> Self {
        self.script(path.to_string(), Scripted::Unreachable)
    }

    /// Make a path answer with an error status
    pub fn failing(self, path: &str, status: u16) -> Self {
        self.script(path.to_string(), Scripted::Status(status))
    }

    /// Paths requested so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().clone()
    }

    /// Number of requests for `path`
    pub fn call_count(&self, path: &str) -> usize {
        self.calls.read().iter().filter(|p| *p == path).count()
    }

    fn respond(&self, path: String) -> Result<Scripted, ApiError> {
        self.calls.write().push(path.clone());
        match self.responses.read().get(&path).cloned() {
            Some(Scripted::Unreachable) => Err(ApiError::Unreachable(format!(
                "dns error: failed to lookup address for {path}"
            ))),
            Some(Scripted::Status(status)) => Err(ApiError::Status {
                status,
                message: "scripted failure".into(),
            }),
            Some(other) => Ok(other),
            None => Err(ApiError::Status {
                status: 404,
                message: format!("no response scripted for {path}"),
            }),
        }
    }
}

fn unexpected(path: &str) -> ApiError {
    ApiError::Decode(format!("scripted response for {path} has the wrong shape"))
}

pub fn listing_path(since: i64) -> String {
    format!("/repositories?since={since}")
}

pub fn repo_path(owner: &str, name: &str) -> String {
    format!("/repos/{owner}/{name}")
}

pub fn first_commits_path(owner: &str, name: &str) -> String {
    format!("/repos/{owner}/{name}/commits")
}

pub fn commits_path(repo_id: i64, page: u32) -> String {
    format!("/repositories/{repo_id}/commits?page={page}")
}

pub fn commit_path(owner: &str, name: &str, sha: &str) -> String {
    format!("/repos/{owner}/{name}/commits/{sha}")
}

#[async_trait]
impl RepositoryApi for InMemoryRepositoryApi {
    async fn rate_limit(&self) -> Result<RateLimit, ApiError> {
        self.calls.write().push("/rate_limit".to_string());
        Ok(RateLimit {
            limit: self.remaining.max(0),
            remaining: self.remaining,
            reset: 0,
        })
    }

    async fn list_repositories(&self, since: i64) -> Result<Page<RepoSummary>, ApiError> {
        let path = listing_path(since);
        match self.respond(path.clone())? {
            Scripted::Repos(page) => Ok(page),
            _ => Err(unexpected(&path)),
        }
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<RepoDetail, ApiError> {
        let path = repo_path(owner, name);
        match self.respond(path.clone())? {
            Scripted::Repo(detail) => Ok(detail),
            _ => Err(unexpected(&path)),
        }
    }

    async fn first_commits_page(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Page<CommitSummary>, ApiError> {
        let path = first_commits_path(owner, name);
        match self.respond(path.clone())? {
            Scripted::Commits(page) => Ok(page),
            _ => Err(unexpected(&path)),
        }
    }

    async fn list_commits(&self, repo_id: i64, page: u32) -> Result<Page<CommitSummary>, ApiError> {
        let path = commits_path(repo_id, page);
        match self.respond(path.clone())? {
            Scripted::Commits(page) => Ok(page),
            _ => Err(unexpected(&path)),
        }
    }

    async fn get_commit(
        &self,
        owner: &str,
        name: &str,
        sha: &str,
    ) -> Result<CommitDetail, ApiError> {
        let path = commit_path(owner, name, sha);
        match self.respond(path.clone())? {
            Scripted::Commit(detail) => Ok(detail),
            _ => Err(unexpected(&path)),
        }
    }
}
