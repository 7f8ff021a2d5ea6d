//! Crawl task handlers
//!
//! Each handler makes one upstream call, stores what it learned and returns
//! the steps to run next. Handlers know nothing about budgets, queues or
//! completion tracking; the dispatcher wraps every returned step in a fresh
//! task.

use tracing::debug;

use crate::github::{ApiError, RepositoryApi};
use crate::records::{CommitRecord, RepoRecord};
use crate::store::{CrawlStore, CrawlStoreError};
use crate::task::CrawlStep;

/// Crawl bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlLimits {
    /// Stop following the repository listing at this many repositories
    pub max_repos: u64,
    /// Stop walking a commit history at this many commits
    pub max_commits: u64,
}

/// Handler failure
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] CrawlStoreError),
}

impl CrawlError {
    /// Whether the task should go back to the queue
    pub fn is_transient(&self) -> bool {
        match self {
            CrawlError::Api(e) => e.is_transient(),
            CrawlError::Store(_) => false,
        }
    }
}

/// Everything a handler needs
pub struct HandlerContext<'a> {
    pub api: &'a dyn RepositoryApi,
    pub store: &'a dyn CrawlStore,
    pub limits: CrawlLimits,
}

/// Run one step and return its children in emit order
pub async fn run(ctx: &HandlerContext<'_>, step: &CrawlStep) -> Result<Vec<CrawlStep>, CrawlError> {
    match step {
        CrawlStep::ListRepos { since, repos_seen } => list_repos(ctx, *since, *repos_seen).await,
        CrawlStep::FetchRepo { owner, name } => fetch_repo(ctx, owner, name).await,
        CrawlStep::FetchLastPage {
            repo_id,
            owner,
            name,
        } => fetch_last_page(ctx, *repo_id, owner, name).await,
        CrawlStep::ListCommitsPage {
            repo_id,
            owner,
            name,
            page,
            commits_seen,
        } => list_commits_page(ctx, *repo_id, owner, name, *page, *commits_seen).await,
        CrawlStep::FetchCommit {
            repo_id,
            owner,
            name,
            sha,
        } => fetch_commit(ctx, *repo_id, owner, name, sha).await,
    }
}

async fn list_repos(
    ctx: &HandlerContext<'_>,
    since: i64,
    repos_seen: u64,
) -> Result<Vec<CrawlStep>, CrawlError> {
    let page = ctx.api.list_repositories(since).await?;
    let originals: Vec<_> = page.items.iter().filter(|r| !r.fork).collect();

    let mut children: Vec<CrawlStep> = originals
        .iter()
        .filter_map(|repo| repo.coordinates())
        .map(|(owner, name)| CrawlStep::FetchRepo {
            owner: owner.to_string(),
            name: name.to_string(),
        })
        .collect();

    let seen = repos_seen + originals.len() as u64;

    // The cursor has to move forward and the page has to have content,
    // otherwise the listing would never end.
    match page.links.next_param("since") {
        Some(next) if next > since && !page.items.is_empty() && seen < ctx.limits.max_repos => {
            children.push(CrawlStep::ListRepos {
                since: next,
                repos_seen: seen,
            });
        }
        next => debug!(since, ?next, seen, "repository listing ends here"),
    }

    Ok(children)
}

async fn fetch_repo(
    ctx: &HandlerContext<'_>,
    owner: &str,
    name: &str,
) -> Result<Vec<CrawlStep>, CrawlError> {
    let detail = ctx.api.get_repository(owner, name).await?;

    let Some(record) = RepoRecord::from_detail(&detail) else {
        debug!(owner, name, fork = detail.fork, "repository skipped");
        return Ok(Vec::new());
    };

    ctx.store.upsert_repo(&record).await?;

    Ok(vec![CrawlStep::FetchLastPage {
        repo_id: record.id,
        owner: owner.to_string(),
        name: name.to_string(),
    }])
}

async fn fetch_last_page(
    ctx: &HandlerContext<'_>,
    repo_id: i64,
    owner: &str,
    name: &str,
) -> Result<Vec<CrawlStep>, CrawlError> {
    let first = ctx.api.first_commits_page(owner, name).await?;

    let last = match first.links.last_param("page") {
        Some(last) => u32::try_from(last).ok().filter(|p| *p >= 1),
        // Everything fits on one page
        None if !first.items.is_empty() => Some(1),
        None => None,
    };

    Ok(last
        .map(|page| CrawlStep::ListCommitsPage {
            repo_id,
            owner: owner.to_string(),
            name: name.to_string(),
            page,
            commits_seen: 0,
        })
        .into_iter()
        .collect())
}

async fn list_commits_page(
    ctx: &HandlerContext<'_>,
    repo_id: i64,
    owner: &str,
    name: &str,
    page: u32,
    commits_seen: u64,
) -> Result<Vec<CrawlStep>, CrawlError> {
    let listing = ctx.api.list_commits(repo_id, page).await?;
    if listing.items.is_empty() {
        return Ok(Vec::new());
    }

    let mut children: Vec<CrawlStep> = listing
        .items
        .iter()
        .filter_map(|c| c.sha.as_deref())
        .map(|sha| CrawlStep::FetchCommit {
            repo_id,
            owner: owner.to_string(),
            name: name.to_string(),
            sha: sha.to_string(),
        })
        .collect();

    let seen = commits_seen + listing.items.len() as u64;
    if page > 1 && seen < ctx.limits.max_commits {
        children.push(CrawlStep::ListCommitsPage {
            repo_id,
            owner: owner.to_string(),
            name: name.to_string(),
            page: page - 1,
            commits_seen: seen,
        });
    }

    Ok(children)
}

async fn fetch_commit(
    ctx: &HandlerContext<'_>,
    repo_id: i64,
    owner: &str,
    name: &str,
    sha: &str,
) -> Result<Vec<CrawlStep>, CrawlError> {
    let detail = ctx.api.get_commit(owner, name, sha).await?;

    match CommitRecord::from_detail(repo_id, &detail) {
        Some(record) => ctx.store.upsert_commit(&record).await?,
        None => debug!(owner, name, sha, "commit without sha skipped"),
    }

    Ok(Vec::new())
}
