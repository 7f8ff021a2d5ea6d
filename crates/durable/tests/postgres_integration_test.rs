//! Integration tests for PostgresDurableStore
//!
//! Run with: TEST_DATABASE_URL=postgres://... cargo test -p repocrawl-durable --test postgres_integration_test
//!
//! Tests are skipped when TEST_DATABASE_URL is not set. Migrations from the
//! workspace `migrations/` directory are applied automatically.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use repocrawl_durable::{
    DeferredQueue, DeferredTask, FleetError, FleetRegistry, FleetSnapshot, KindPriority,
    LaunchError, LaunchPlanner, PostgresDurableStore,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

// The tables are shared, so tests in this file take turns
static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    MIGRATOR.run(&pool).await.ok()?;
    sqlx::query("TRUNCATE deferred, executing")
        .execute(&pool)
        .await
        .ok()?;
    Some(pool)
}

fn store(pool: PgPool) -> PostgresDurableStore {
    PostgresDurableStore::new(
        pool,
        KindPriority::new([
            "fetch_commit",
            "list_commits_page",
            "fetch_last_page",
            "fetch_repo",
            "list_repos",
        ]),
    )
}

fn task(kind: &str) -> DeferredTask {
    DeferredTask::new(Uuid::now_v7(), kind, json!({ "kind": kind }))
}

struct FixedPlanner {
    count: u32,
    fail: bool,
    launched: Mutex<Vec<String>>,
}

impl FixedPlanner {
    fn new(count: u32) -> Self {
        Self {
            count,
            fail: false,
            launched: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LaunchPlanner for FixedPlanner {
    fn plan(&self, _snapshot: FleetSnapshot) -> u32 {
        self.count
    }

    async fn launch(&self, worker_id: &str) -> Result<(), LaunchError> {
        if self.fail {
            return Err(LaunchError::Transport("connection refused".into()));
        }
        self.launched.lock().push(worker_id.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_dequeue_follows_kind_priority() {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let store = store(pool);

    let list = task("list_repos");
    let repo = task("fetch_repo");
    let commit = task("fetch_commit");
    let page = task("list_commits_page");
    for t in [&list, &repo, &commit, &page] {
        store.enqueue(t.clone()).await.unwrap();
    }

    let claimed = store.dequeue_up_to(3).await.unwrap();
    let kinds: Vec<&str> = claimed.iter().map(|t| t.kind.as_str()).collect();
    assert_eq!(kinds, vec!["fetch_commit", "list_commits_page", "fetch_repo"]);
    assert_eq!(claimed[0].payload, commit.payload);
    assert_eq!(store.backlog().await.unwrap(), 1);

    let rest = store.dequeue_up_to(10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, list.id);
}

#[tokio::test]
async fn test_enqueue_upserts_on_id() {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let store = store(pool);

    let mut t = task("list_repos");
    store.enqueue(t.clone()).await.unwrap();
    t.payload = json!({ "since": 42 });
    store.enqueue(t.clone()).await.unwrap();

    assert_eq!(store.backlog().await.unwrap(), 1);
    let claimed = store.dequeue_up_to(1).await.unwrap();
    assert_eq!(claimed[0].payload, json!({ "since": 42 }));
}

#[tokio::test]
async fn test_batch_enqueue_is_atomic() {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let store = store(pool);

    let batch: Vec<DeferredTask> = (0..25).map(|_| task("fetch_commit")).collect();
    store.enqueue_batch(batch).await.unwrap();
    assert_eq!(store.backlog().await.unwrap(), 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dequeuers_never_share_rows() {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let store = Arc::new(store(pool));

    let mut expected: Vec<Uuid> = Vec::new();
    let batch: Vec<DeferredTask> = (0..120).map(|_| task("fetch_commit")).collect();
    expected.extend(batch.iter().map(|t| t.id));
    store.enqueue_batch(batch).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let claimed = store.dequeue_up_to(9).await.unwrap();
                if claimed.is_empty() {
                    break;
                }
                mine.extend(claimed.into_iter().map(|t| t.id));
            }
            mine
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }
    claimed.sort();
    expected.sort();
    assert_eq!(claimed, expected);
}

#[tokio::test]
async fn test_dequeue_skips_row_deleted_by_another_worker() {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let store = store(pool.clone());

    let a = task("fetch_commit");
    let b = task("fetch_commit");
    store.enqueue_batch(vec![a.clone(), b.clone()]).await.unwrap();

    // Another worker holds `a` locked; our claim must skip it and not block
    let mut other = pool.begin().await.unwrap();
    sqlx::query("SELECT id FROM deferred WHERE id = $1 FOR UPDATE")
        .bind(a.id)
        .execute(&mut *other)
        .await
        .unwrap();

    let claimed = store.dequeue_up_to(2).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, b.id);

    sqlx::query("DELETE FROM deferred WHERE id = $1")
        .bind(a.id)
        .execute(&mut *other)
        .await
        .unwrap();
    other.commit().await.unwrap();

    assert!(store.dequeue_up_to(2).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retire_registers_successors_atomically() {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let store = store(pool);

    store.register_worker("retiring").await.unwrap();
    store.register_worker("peer").await.unwrap();
    store.enqueue(task("list_repos")).await.unwrap();

    let planner = FixedPlanner::new(2);
    let outcome = store.retire_worker("retiring", &planner).await.unwrap();

    assert_eq!(
        outcome.snapshot,
        FleetSnapshot {
            backlog: 1,
            fleet_size: 2
        }
    );
    assert_eq!(*planner.launched.lock(), outcome.launched);

    let ids: Vec<String> = store
        .list_workers()
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.worker_id)
        .collect();
    assert!(!ids.contains(&"retiring".to_string()));
    assert!(ids.contains(&"peer".to_string()));
    for launched in &outcome.launched {
        assert!(ids.contains(launched));
    }
    assert_eq!(store.fleet_size().await.unwrap(), 3);
}

#[tokio::test]
async fn test_failed_launch_rolls_back_retirement() {
    let _guard = DB_LOCK.lock().await;
    let Some(pool) = test_pool().await else {
        eprintln!("Skipping test: TEST_DATABASE_URL not set");
        return;
    };
    let store = store(pool);

    store.register_worker("retiring").await.unwrap();
    store.enqueue(task("list_repos")).await.unwrap();

    let mut planner = FixedPlanner::new(1);
    planner.fail = true;
    let err = store.retire_worker("retiring", &planner).await.unwrap_err();

    assert!(matches!(err, FleetError::Launch(_)));
    let ids: Vec<String> = store
        .list_workers()
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.worker_id)
        .collect();
    assert_eq!(ids, vec!["retiring".to_string()]);
}
