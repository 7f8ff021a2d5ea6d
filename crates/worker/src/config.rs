//! Worker configuration loaded from the environment

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Worker configuration
///
/// Serializable because a retiring worker hands a copy to each successor it
/// launches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity of this worker in the fleet registry
    pub worker_id: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Connection pool size
    pub db_max_connections: u32,

    /// Base URL of the repository API
    pub github_api: String,

    /// Optional API token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,

    /// Stop following the repository listing after this many repositories
    pub max_repos: u64,

    /// Stop walking a repository's history after this many commits
    pub max_commits: u64,

    /// Fleet size the autoscaler tapers toward
    pub max_workers: u64,

    /// Listing cursor for the bootstrap task
    pub start_repo: i64,

    /// Seed a bootstrap task instead of draining the queue
    pub initial_crawl: bool,

    /// Write audit rows for every task outcome
    pub audit_log: bool,

    /// Upper bound on a single refill claim
    pub dequeue_batch_size: usize,

    /// Webhook that starts successor workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_endpoint: Option<String>,

    /// Log launches instead of performing them
    pub launch_dry_run: bool,
}

impl WorkerConfig {
    /// Configuration with defaults for everything but the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            database_url: database_url.into(),
            db_max_connections: 4,
            github_api: "https://api.github.com".to_string(),
            github_token: None,
            max_repos: 1000,
            max_commits: 100,
            max_workers: 10,
            start_repo: 0,
            initial_crawl: false,
            audit_log: false,
            dequeue_batch_size: 50,
            launch_endpoint: None,
            launch_dry_run: false,
        }
    }

    /// Load configuration from environment variables
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let mut config = Self::new(database_url);

        if let Some(id) = lookup("WORKER_ID").filter(|s| !s.is_empty()) {
            config.worker_id = id;
        }
        if let Some(api) = lookup("GITHUB_API") {
            config.github_api = api.trim_end_matches('/').to_string();
        }
        config.github_token = lookup("GITHUB_TOKEN").filter(|s| !s.is_empty());
        config.launch_endpoint = lookup("LAUNCH_ENDPOINT").filter(|s| !s.is_empty());

        config.db_max_connections =
            parse(&lookup, "DB_MAX_CONNECTIONS")?.unwrap_or(config.db_max_connections);
        config.max_repos = parse(&lookup, "MAX_REPOS")?.unwrap_or(config.max_repos);
        config.max_commits = parse(&lookup, "MAX_COMMITS")?.unwrap_or(config.max_commits);
        config.max_workers = parse(&lookup, "MAX_WORKERS")?.unwrap_or(config.max_workers);
        config.start_repo = parse(&lookup, "START_REPO")?.unwrap_or(config.start_repo);
        config.dequeue_batch_size =
            parse(&lookup, "DEQUEUE_BATCH_SIZE")?.unwrap_or(config.dequeue_batch_size);

        config.initial_crawl = flag(&lookup, "INITIAL_CRAWL")?.unwrap_or(false);
        config.audit_log = flag(&lookup, "AUDIT_LOG")?.unwrap_or(false);
        config.launch_dry_run = flag(&lookup, "LAUNCH_DRY_RUN")?.unwrap_or(false);

        if config.db_max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "DB_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }
        if config.dequeue_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "DEQUEUE_BATCH_SIZE",
                value: "0".into(),
            });
        }

        Ok(config)
    }

    /// Configuration handed to a launched successor
    ///
    /// Successors always drain the queue; only the first worker seeds.
    pub fn successor(&self, worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            initial_crawl: false,
            ..self.clone()
        }
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { key, value }),
        },
    }
}
