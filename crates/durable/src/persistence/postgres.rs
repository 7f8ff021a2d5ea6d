//! PostgreSQL implementation of the deferred queue and fleet registry
//!
//! - Exactly-once claims with `FOR UPDATE SKIP LOCKED` plus `DELETE ... RETURNING`
//! - Priority ordering by task kind
//! - Transactional worker retirement

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;

/// PostgreSQL implementation of [`DeferredQueue`] and [`FleetRegistry`]
///
/// Expects the `deferred` and `executing` tables from the workspace migrations.
///
/// # Example
///
/// ```ignore
/// use repocrawl_durable::{KindPriority, PostgresDurableStore};
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/crawl").await?;
/// let store = PostgresDurableStore::new(pool, KindPriority::new(["urgent", "normal"]));
/// ```
#[derive(Clone)]
pub struct PostgresDurableStore {
    pool: PgPool,
    priority: KindPriority,
}

impl PostgresDurableStore {
    /// Create a new store over the given connection pool
    pub fn new(pool: PgPool, priority: KindPriority) -> Self {
        Self { pool, priority }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn count_to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

#[async_trait]
impl DeferredQueue for PostgresDurableStore {
    #[instrument(skip(self, task), fields(id = %task.id, kind = %task.kind))]
    async fn enqueue(&self, task: DeferredTask) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO deferred (id, kind, payload, deferred_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (id) DO UPDATE SET kind = EXCLUDED.kind, payload = EXCLUDED.payload
            "#,
        )
        .bind(task.id)
        .bind(&task.kind)
        .bind(&task.payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!("task deferred");
        Ok(())
    }

    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn enqueue_batch(&self, tasks: Vec<DeferredTask>) -> Result<(), StoreError> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for task in &tasks {
            sqlx::query(
                r#"
                INSERT INTO deferred (id, kind, payload, deferred_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (id) DO UPDATE SET kind = EXCLUDED.kind, payload = EXCLUDED.payload
                "#,
            )
            .bind(task.id)
            .bind(&task.kind)
            .bind(&task.payload)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        debug!("task batch deferred");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn dequeue_up_to(&self, max: usize) -> Result<Vec<DeferredTask>, StoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Unknown kinds get a NULL position and sort after every listed kind
        let rows = sqlx::query(
            r#"
            SELECT id, kind, payload
            FROM deferred
            ORDER BY array_position($1::text[], kind) ASC NULLS LAST, deferred_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(self.priority.kinds())
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        if rows.is_empty() {
            tx.commit().await.map_err(db_err)?;
            return Ok(Vec::new());
        }

        let selected: Vec<DeferredTask> = rows
            .iter()
            .map(|row| DeferredTask {
                id: row.get("id"),
                kind: row.get("kind"),
                payload: row.get("payload"),
            })
            .collect();
        let ids: Vec<Uuid> = selected.iter().map(|t| t.id).collect();

        let deleted: Vec<Uuid> = sqlx::query_scalar(
            r#"
            DELETE FROM deferred
            WHERE id = ANY($1)
            RETURNING id
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(|e| {
            error!(error = %e, "dequeue commit failed, claim rolled back");
            db_err(e)
        })?;

        let claimed: Vec<DeferredTask> = selected
            .into_iter()
            .filter(|t| deleted.contains(&t.id))
            .collect();

        debug!(asked = max, got = claimed.len(), "tasks dequeued");
        Ok(claimed)
    }

    async fn backlog(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deferred")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count_to_u64(count))
    }
}

#[async_trait]
impl FleetRegistry for PostgresDurableStore {
    #[instrument(skip(self))]
    async fn register_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO executing (id, registered_at)
            VALUES ($1, NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM executing WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn fleet_size(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM executing")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count_to_u64(count))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>, StoreError> {
        let rows = sqlx::query("SELECT id, registered_at FROM executing ORDER BY registered_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| WorkerRegistration {
                worker_id: row.get("id"),
                registered_at: row.get::<DateTime<Utc>, _>("registered_at"),
            })
            .collect())
    }

    #[instrument(skip(self, planner))]
    async fn retire_worker(
        &self,
        worker_id: &str,
        planner: &dyn LaunchPlanner,
    ) -> Result<RetireOutcome, FleetError> {
        // Dropping `tx` on any early return rolls the whole retirement back
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let backlog: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deferred")
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let fleet_size: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM executing")
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query("DELETE FROM executing WHERE id = $1")
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let snapshot = FleetSnapshot {
            backlog: count_to_u64(backlog),
            fleet_size: count_to_u64(fleet_size),
        };
        let count = planner.plan(snapshot);

        let mut launched = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let successor = Uuid::now_v7().to_string();
            sqlx::query("INSERT INTO executing (id, registered_at) VALUES ($1, NOW())")
                .bind(&successor)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            planner.launch(&successor).await?;
            launched.push(successor);
        }

        tx.commit().await.map_err(db_err)?;

        info!(
            backlog = snapshot.backlog,
            fleet_size = snapshot.fleet_size,
            launched = launched.len(),
            "worker retired"
        );

        Ok(RetireOutcome { snapshot, launched })
    }
}
