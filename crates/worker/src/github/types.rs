//! Response types for the repository API
//!
//! Only the fields the crawler stores are modelled; every field is optional
//! because the API omits them freely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Remaining-call budget reported by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: i64,
    pub remaining: i64,
    /// Unix time at which the budget resets
    pub reset: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RateLimitResponse {
    pub rate: RateLimit,
}

/// Account that owns a repository or authored a commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub login: Option<String>,
    pub id: Option<i64>,
}

/// Entry in the public repository listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSummary {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub owner: Option<Account>,
    #[serde(default)]
    pub fork: bool,
}

impl RepoSummary {
    /// Owner login and repository name, when both are present
    pub fn coordinates(&self) -> Option<(&str, &str)> {
        let owner = self.owner.as_ref()?.login.as_deref()?;
        let name = self.name.as_deref()?;
        Some((owner, name))
    }
}

/// Full repository metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDetail {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub full_name: Option<String>,
    pub owner: Option<Account>,
    #[serde(default)]
    pub fork: bool,
    pub language: Option<String>,
    pub forks_count: Option<i64>,
    pub stargazers_count: Option<i64>,
    pub watchers_count: Option<i64>,
    pub subscribers_count: Option<i64>,
    pub size: Option<i64>,
    pub has_issues: Option<bool>,
    pub has_wiki: Option<bool>,
    pub has_pages: Option<bool>,
    pub has_downloads: Option<bool>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Entry in a commit listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub sha: Option<String>,
}

/// Git-level author or committer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitActor {
    pub name: Option<String>,
    pub email: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommit {
    pub author: Option<GitActor>,
    pub committer: Option<GitActor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStats {
    pub additions: Option<i64>,
    pub deletions: Option<i64>,
    pub total: Option<i64>,
}

/// Per-file change counts of a commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFile {
    pub filename: Option<String>,
    #[serde(default)]
    pub additions: i64,
    #[serde(default)]
    pub deletions: i64,
    #[serde(default)]
    pub changes: i64,
}

/// Full commit with stats and files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDetail {
    pub sha: Option<String>,
    pub commit: Option<GitCommit>,
    pub author: Option<Account>,
    pub committer: Option<Account>,
    pub stats: Option<CommitStats>,
    pub files: Option<Vec<CommitFile>>,
}

/// Pagination links from a `Link` header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageLinks {
    pub next: Option<String>,
    pub last: Option<String>,
}

impl PageLinks {
    /// Parse a header such as `<https://...?page=2>; rel="next", <...>; rel="last"`
    pub fn parse(header: &str) -> Self {
        let mut links = PageLinks::default();

        for part in header.split(',') {
            let mut pieces = part.split(';');
            let Some(target) = pieces.next() else {
                continue;
            };
            let target = target.trim();
            let Some(url) = target
                .strip_prefix('<')
                .and_then(|t| t.strip_suffix('>'))
            else {
                continue;
            };

            for param in pieces {
                let param = param.trim();
                let Some(rel) = param.strip_prefix("rel=") else {
                    continue;
                };
                for rel in rel.trim_matches('"').split_whitespace() {
                    match rel {
                        "next" => links.next = Some(url.to_string()),
                        "last" => links.last = Some(url.to_string()),
                        _ => {}
                    }
                }
            }
        }

        links
    }

    /// Integer query parameter of the `next` link
    pub fn next_param(&self, name: &str) -> Option<i64> {
        self.next.as_deref().and_then(|url| query_param(url, name))
    }

    /// Integer query parameter of the `last` link
    pub fn last_param(&self, name: &str) -> Option<i64> {
        self.last.as_deref().and_then(|url| query_param(url, name))
    }
}

fn query_param(url: &str, name: &str) -> Option<i64> {
    let url = Url::parse(url).ok()?;
    let value = url
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())?;
    value.parse().ok()
}

/// One page of a listing plus its pagination links
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub links: PageLinks,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            links: PageLinks::default(),
        }
    }

    pub fn with_next(mut self, url: impl Into<String>) -> Self {
        self.links.next = Some(url.into());
        self
    }

    pub fn with_last(mut self, url: impl Into<String>) -> Self {
        self.links.last = Some(url.into());
        self
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
