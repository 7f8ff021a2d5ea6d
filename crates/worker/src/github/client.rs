// HTTP client for the repository API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use super::types::*;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ApiError {
    /// No connection could be made (DNS failure, refused connection)
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("API error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl ApiError {
    /// Whether the call should be retried later by another worker
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Unreachable(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            ApiError::Unreachable(e.to_string())
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Http(e.to_string())
        }
    }
}

/// The repository API as seen by the crawl handlers
#[async_trait]
pub trait RepositoryApi: Send + Sync + 'static {
    /// Remaining call budget for this credential
    async fn rate_limit(&self) -> Result<RateLimit, ApiError>;

    /// Public repositories with an id greater than `since`
    async fn list_repositories(&self, since: i64) -> Result<Page<RepoSummary>, ApiError>;

    async fn get_repository(&self, owner: &str, name: &str) -> Result<RepoDetail, ApiError>;

    /// First page of a repository's commits, fetched for its pagination links
    ///
    /// An empty repository yields an empty page.
    async fn first_commits_page(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Page<CommitSummary>, ApiError>;

    /// One page of a repository's commits, addressed by repository id
    async fn list_commits(&self, repo_id: i64, page: u32) -> Result<Page<CommitSummary>, ApiError>;

    async fn get_commit(&self, owner: &str, name: &str, sha: &str)
        -> Result<CommitDetail, ApiError>;
}

/// [`RepositoryApi`] over HTTP
pub struct GithubClient {
    base_url: String,
    http: reqwest::Client,
}

impl GithubClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("repocrawl"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ApiError::Http(format!("invalid token header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(DEFAULT_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "GET");
        let response = self.http.get(&url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn get_page<T: DeserializeOwned>(&self, path: &str) -> Result<Page<T>, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "GET page");
        let response = self.http.get(&url).send().await?;

        // An empty repository answers commit listings with 409
        if response.status() == StatusCode::CONFLICT {
            return Ok(Page::default());
        }

        let response = check_status(response).await?;
        let links = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .map(PageLinks::parse)
            .unwrap_or_default();
        let items: Vec<T> = response.json().await?;

        Ok(Page { items, links })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RepositoryApi for GithubClient {
    async fn rate_limit(&self) -> Result<RateLimit, ApiError> {
        let body: RateLimitResponse = self.get_json("/rate_limit").await?;
        Ok(body.rate)
    }

    async fn list_repositories(&self, since: i64) -> Result<Page<RepoSummary>, ApiError> {
        self.get_page(&format!("/repositories?since={since}")).await
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<RepoDetail, ApiError> {
        self.get_json(&format!("/repos/{owner}/{name}")).await
    }

    async fn first_commits_page(
        &self,
        owner: &str,
        name: &str,
    ) -> Result<Page<CommitSummary>, ApiError> {
        self.get_page(&format!("/repos/{owner}/{name}/commits")).await
    }

    async fn list_commits(&self, repo_id: i64, page: u32) -> Result<Page<CommitSummary>, ApiError> {
        self.get_page(&format!("/repositories/{repo_id}/commits?page={page}"))
            .await
    }

    async fn get_commit(
        &self,
        owner: &str,
        name: &str,
        sha: &str,
    ) -> Result<CommitDetail, ApiError> {
        self.get_json(&format!("/repos/{owner}/{name}/commits/{sha}"))
            .await
    }
}
