//! Audit sidecar
//!
//! Optional trail of task outcomes, launches and shutdown failures. Writes
//! are best effort: failures are logged and never reach the caller. Every
//! write holds a [`WriteGuard`](repocrawl_durable::WriteGuard) so shutdown
//! can wait for them before closing the pool.

use std::fmt;

use repocrawl_durable::WriteTracker;
use sqlx::PgPool;
use tracing::{error, instrument};

use crate::task::{CrawlStep, CrawlTask};

/// Outcome recorded for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Completed,
    Failed,
    Deferred,
    Redeferred,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Completed => "completed",
            AuditEvent::Failed => "failed",
            AuditEvent::Deferred => "deferred",
            AuditEvent::Redeferred => "redeferred",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit writer. Disabled instances accept every call and do nothing.
#[derive(Clone)]
pub struct AuditLog {
    pool: Option<PgPool>,
    worker_id: String,
    writes: WriteTracker,
}

impl AuditLog {
    pub fn new(pool: PgPool, worker_id: impl Into<String>, writes: WriteTracker) -> Self {
        Self {
            pool: Some(pool),
            worker_id: worker_id.into(),
            writes,
        }
    }

    pub fn disabled(worker_id: impl Into<String>, writes: WriteTracker) -> Self {
        Self {
            pool: None,
            worker_id: worker_id.into(),
            writes,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Tracker counting this log's writes in flight
    pub fn writes(&self) -> &WriteTracker {
        &self.writes
    }

    /// Record the outcome of one task in its kind's table
    #[instrument(skip(self, task, error), fields(id = %task.id(), kind = %task.task_kind()))]
    pub async fn record_task(
        &self,
        task: &CrawlTask,
        event: AuditEvent,
        error: Option<&str>,
        from_queue: bool,
    ) {
        let Some(pool) = &self.pool else {
            return;
        };
        let _guard = self.writes.begin();

        let payload = serde_json::to_value(task).ok();
        let id = task.id();
        let worker_id = self.worker_id.as_str();
        let event = event.as_str();

        let result = match task.step() {
            CrawlStep::ListRepos { since, repos_seen } => {
                sqlx::query(
                    r#"
                    INSERT INTO list_repos_log
                        (correlation_id, since, repos_seen, payload, worker_id, event, error, from_queue)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(id)
                .bind(*since)
                .bind(*repos_seen as i64)
                .bind(payload)
                .bind(worker_id)
                .bind(event)
                .bind(error)
                .bind(from_queue)
                .execute(pool)
                .await
            }
            CrawlStep::FetchRepo { owner, name } => {
                sqlx::query(
                    r#"
                    INSERT INTO fetch_repo_log
                        (correlation_id, owner, name, payload, worker_id, event, error, from_queue)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(id)
                .bind(owner)
                .bind(name)
                .bind(payload)
                .bind(worker_id)
                .bind(event)
                .bind(error)
                .bind(from_queue)
                .execute(pool)
                .await
            }
            CrawlStep::FetchLastPage {
                repo_id,
                owner,
                name,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO fetch_last_page_log
                        (correlation_id, repo_id, owner, name, payload, worker_id, event, error, from_queue)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(id)
                .bind(*repo_id)
                .bind(owner)
                .bind(name)
                .bind(payload)
                .bind(worker_id)
                .bind(event)
                .bind(error)
                .bind(from_queue)
                .execute(pool)
                .await
            }
            CrawlStep::ListCommitsPage {
                repo_id,
                owner,
                name,
                page,
                commits_seen,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO list_commits_page_log
                        (correlation_id, repo_id, owner, name, page, commits_seen,
                         payload, worker_id, event, error, from_queue)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    "#,
                )
                .bind(id)
                .bind(*repo_id)
                .bind(owner)
                .bind(name)
                .bind(*page as i32)
                .bind(*commits_seen as i64)
                .bind(payload)
                .bind(worker_id)
                .bind(event)
                .bind(error)
                .bind(from_queue)
                .execute(pool)
                .await
            }
            CrawlStep::FetchCommit {
                repo_id,
                owner,
                name,
                sha,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO fetch_commit_log
                        (correlation_id, repo_id, owner, name, sha, payload, worker_id, event, error, from_queue)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(id)
                .bind(*repo_id)
                .bind(owner)
                .bind(name)
                .bind(sha)
                .bind(payload)
                .bind(worker_id)
                .bind(event)
                .bind(error)
                .bind(from_queue)
                .execute(pool)
                .await
            }
        };

        if let Err(e) = result {
            error!(error = %e, "failed to write task audit row");
        }
    }

    /// Record a successor launch
    pub async fn record_spawn(&self, spawned_worker_id: &str) {
        let Some(pool) = &self.pool else {
            return;
        };
        let _guard = self.writes.begin();

        let result = sqlx::query(
            r#"
            INSERT INTO spawn_log (worker_id, spawned_worker_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(&self.worker_id)
        .bind(spawned_worker_id)
        .execute(pool)
        .await;

        if let Err(e) = result {
            error!(error = %e, spawned_worker_id, "failed to write spawn audit row");
        }
    }

    /// Record a failed retirement
    pub async fn record_shutdown_error(&self, message: &str) {
        let Some(pool) = &self.pool else {
            return;
        };
        let _guard = self.writes.begin();

        let result = sqlx::query(
            r#"
            INSERT INTO shutdown_error_log (worker_id, error)
            VALUES ($1, $2)
            "#,
        )
        .bind(&self.worker_id)
        .bind(message)
        .execute(pool)
        .await;

        if let Err(e) = result {
            error!(error = %e, "failed to write shutdown audit row");
        }
    }

    /// Record a refill claim. `got` is zero when the claim failed.
    pub async fn record_dequeue(&self, asked: usize, got: usize, failure: Option<&str>) {
        let Some(pool) = &self.pool else {
            return;
        };
        let _guard = self.writes.begin();

        let result = sqlx::query(
            r#"
            INSERT INTO dequeue_log (worker_id, asked, got, error)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&self.worker_id)
        .bind(asked as i64)
        .bind(got as i64)
        .bind(failure)
        .execute(pool)
        .await;

        if let Err(e) = result {
            error!(error = %e, "failed to write dequeue audit row");
        }
    }
}
