//! Repository API access
//!
//! This module provides:
//! - [`RepositoryApi`] trait used by the crawl handlers
//! - [`GithubClient`] over HTTP
//! - [`InMemoryRepositoryApi`] for testing

mod client;
mod memory;
mod types;

pub use client::{ApiError, GithubClient, RepositoryApi};
pub use memory::{
    commit_path, commits_path, first_commits_path, listing_path, repo_path, InMemoryRepositoryApi,
};
pub use types::{
    Account, CommitDetail, CommitFile, CommitStats, CommitSummary, GitActor, GitCommit, Page,
    PageLinks, RateLimit, RepoDetail, RepoSummary,
};
