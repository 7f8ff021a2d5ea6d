//! PostgreSQL implementation of CrawlStore

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};

use super::{CrawlStore, CrawlStoreError};
use crate::records::{CommitRecord, RepoRecord};

/// PostgreSQL implementation of [`CrawlStore`]
///
/// Writes into the `repos` and `commits` tables with `ON CONFLICT` upserts.
#[derive(Clone)]
pub struct PostgresCrawlStore {
    pool: PgPool,
}

impl PostgresCrawlStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CrawlStore for PostgresCrawlStore {
    #[instrument(skip(self, record), fields(id = record.id))]
    async fn upsert_repo(&self, record: &RepoRecord) -> Result<(), CrawlStoreError> {
        sqlx::query(
            r#"
            INSERT INTO repos (
                id, owner_login, owner_id, name, full_name, language,
                forks_count, stargazers_count, watchers_count, subscribers_count, size,
                has_issues, has_wiki, has_pages, has_downloads,
                pushed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (id) DO UPDATE SET
                owner_login = EXCLUDED.owner_login,
                owner_id = EXCLUDED.owner_id,
                name = EXCLUDED.name,
                full_name = EXCLUDED.full_name,
                language = EXCLUDED.language,
                forks_count = EXCLUDED.forks_count,
                stargazers_count = EXCLUDED.stargazers_count,
                watchers_count = EXCLUDED.watchers_count,
                subscribers_count = EXCLUDED.subscribers_count,
                size = EXCLUDED.size,
                has_issues = EXCLUDED.has_issues,
                has_wiki = EXCLUDED.has_wiki,
                has_pages = EXCLUDED.has_pages,
                has_downloads = EXCLUDED.has_downloads,
                pushed_at = EXCLUDED.pushed_at,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id)
        .bind(&record.owner_login)
        .bind(record.owner_id)
        .bind(&record.name)
        .bind(&record.full_name)
        .bind(&record.language)
        .bind(record.forks_count)
        .bind(record.stargazers_count)
        .bind(record.watchers_count)
        .bind(record.subscribers_count)
        .bind(record.size)
        .bind(record.has_issues)
        .bind(record.has_wiki)
        .bind(record.has_pages)
        .bind(record.has_downloads)
        .bind(record.pushed_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlStoreError::Database(e.to_string()))?;

        debug!("repo upserted");
        Ok(())
    }

    #[instrument(skip(self, record), fields(sha = %record.sha))]
    async fn upsert_commit(&self, record: &CommitRecord) -> Result<(), CrawlStoreError> {
        sqlx::query(
            r#"
            INSERT INTO commits (
                sha, repo_id,
                author_name, author_email, author_date,
                committer_name, committer_email, committer_date,
                author_login, author_id, committer_login, committer_id,
                additions, deletions, total,
                test_additions, test_deletions, test_changes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (sha) DO UPDATE SET
                repo_id = EXCLUDED.repo_id,
                author_name = EXCLUDED.author_name,
                author_email = EXCLUDED.author_email,
                author_date = EXCLUDED.author_date,
                committer_name = EXCLUDED.committer_name,
                committer_email = EXCLUDED.committer_email,
                committer_date = EXCLUDED.committer_date,
                author_login = EXCLUDED.author_login,
                author_id = EXCLUDED.author_id,
                committer_login = EXCLUDED.committer_login,
                committer_id = EXCLUDED.committer_id,
                additions = EXCLUDED.additions,
                deletions = EXCLUDED.deletions,
                total = EXCLUDED.total,
                test_additions = EXCLUDED.test_additions,
                test_deletions = EXCLUDED.test_deletions,
                test_changes = EXCLUDED.test_changes
            "#,
        )
        .bind(&record.sha)
        .bind(record.repo_id)
        .bind(&record.author_name)
        .bind(&record.author_email)
        .bind(record.author_date)
        .bind(&record.committer_name)
        .bind(&record.committer_email)
        .bind(record.committer_date)
        .bind(&record.author_login)
        .bind(record.author_id)
        .bind(&record.committer_login)
        .bind(record.committer_id)
        .bind(record.additions)
        .bind(record.deletions)
        .bind(record.total)
        .bind(record.test_additions)
        .bind(record.test_deletions)
        .bind(record.test_changes)
        .execute(&self.pool)
        .await
        .map_err(|e| CrawlStoreError::Database(e.to_string()))?;

        debug!("commit upserted");
        Ok(())
    }
}
