//! End-to-end worker scenarios against in-memory collaborators

use std::sync::Arc;
use std::time::Duration;

use repocrawl_durable::{
    Deferrable, DeferredQueue, FleetRegistry, InMemoryDurableStore, WriteTracker,
};
use repocrawl_worker::github::{
    Account, CommitDetail, CommitSummary, InMemoryRepositoryApi, Page, RepoDetail, RepoSummary,
};
use repocrawl_worker::{
    AuditLog, CrawlStep, CrawlTask, CrawlWorker, DryRunLauncher, InMemoryCrawlStore, TaskKind,
    WorkerConfig, WorkerParts,
};
use tokio::sync::watch;

struct Harness {
    queue: Arc<InMemoryDurableStore>,
    store: Arc<InMemoryCrawlStore>,
    launcher: Arc<DryRunLauncher>,
    api: Arc<InMemoryRepositoryApi>,
}

fn config(initial_crawl: bool, start_repo: i64) -> WorkerConfig {
    let mut config = WorkerConfig::new("postgres://unused");
    config.worker_id = "worker-under-test".into();
    config.initial_crawl = initial_crawl;
    config.start_repo = start_repo;
    config.max_workers = 10;
    config
}

async fn start(config: WorkerConfig, api: InMemoryRepositoryApi) -> (CrawlWorker, Harness) {
    start_with_queue(
        config,
        api,
        Arc::new(InMemoryDurableStore::new(TaskKind::queue_priority())),
    )
    .await
}

async fn start_with_queue(
    config: WorkerConfig,
    api: InMemoryRepositoryApi,
    queue: Arc<InMemoryDurableStore>,
) -> (CrawlWorker, Harness) {
    let store = Arc::new(InMemoryCrawlStore::new());
    let launcher = Arc::new(DryRunLauncher::new());
    let api = Arc::new(api);

    let parts = WorkerParts {
        queue: queue.clone(),
        fleet: queue.clone(),
        api: api.clone(),
        store: store.clone(),
        launcher: launcher.clone(),
        audit: AuditLog::disabled(config.worker_id.clone(), WriteTracker::new()),
    };

    let worker = CrawlWorker::start(config, parts).await.unwrap();
    (
        worker,
        Harness {
            queue,
            store,
            launcher,
            api,
        },
    )
}

async fn run(worker: &CrawlWorker) -> repocrawl_worker::RunSummary {
    let (_stop_tx, stop_rx) = watch::channel(false);
    tokio::time::timeout(Duration::from_secs(10), worker.run(stop_rx))
        .await
        .expect("worker did not become quiescent")
}

fn owner(login: &str) -> Option<Account> {
    Some(Account {
        login: Some(login.to_string()),
        id: Some(1),
    })
}

fn listed(id: i64, login: &str, name: &str, fork: bool) -> RepoSummary {
    RepoSummary {
        id: Some(id),
        name: Some(name.to_string()),
        owner: owner(login),
        fork,
    }
}

fn commits(shas: &[&str]) -> Page<CommitSummary> {
    Page::new(
        shas.iter()
            .map(|s| CommitSummary {
                sha: Some(s.to_string()),
            })
            .collect(),
    )
}

#[tokio::test]
async fn test_zero_budget_defers_bootstrap() {
    let (worker, h) = start(config(true, 0), InMemoryRepositoryApi::new(0)).await;

    let summary = run(&worker).await;

    assert_eq!(summary.admitted, 0);
    assert_eq!(summary.deferred, 1);
    let rows = h.queue.deferred_tasks();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, "list_repos");
    assert_eq!(
        rows[0].decode::<CrawlTask>().unwrap().step(),
        &CrawlStep::ListRepos {
            since: 0,
            repos_seen: 0
        }
    );
    // Only the rate limit was read; the listing never ran
    assert_eq!(h.api.calls(), vec!["/rate_limit"]);
}

#[tokio::test]
async fn test_listing_children_are_deferred_in_order() {
    let api = InMemoryRepositoryApi::new(1).with_repositories(
        100,
        Page::new(vec![
            listed(101, "a", "one", false),
            listed(102, "b", "two", false),
            listed(103, "c", "fork", true),
            listed(104, "d", "three", false),
        ])
        .with_next("https://api.github.com/repositories?since=200"),
    );
    let (worker, h) = start(config(true, 100), api).await;

    let summary = run(&worker).await;
    assert_eq!(summary.admitted, 1);
    assert_eq!(summary.deferred, 4);
    assert_eq!(summary.succeeded, 1);

    let steps: Vec<CrawlStep> = h
        .queue
        .deferred_tasks()
        .iter()
        .map(|row| row.decode::<CrawlTask>().unwrap().step().clone())
        .collect();

    // Claim order puts repository fetches before the next listing
    assert_eq!(
        steps,
        vec![
            CrawlStep::FetchRepo {
                owner: "a".into(),
                name: "one".into()
            },
            CrawlStep::FetchRepo {
                owner: "b".into(),
                name: "two".into()
            },
            CrawlStep::FetchRepo {
                owner: "d".into(),
                name: "three".into()
            },
            CrawlStep::ListRepos {
                since: 200,
                repos_seen: 3
            },
        ]
    );
}

#[tokio::test]
async fn test_full_crawl_reaches_quiescence() {
    let api = InMemoryRepositoryApi::new(100)
        .with_repositories(
            0,
            Page::new(vec![
                listed(7, "octo", "hello", false),
                listed(8, "octo", "spoon", true),
            ]),
        )
        .with_repository(
            "octo",
            "hello",
            RepoDetail {
                id: Some(7),
                name: Some("hello".into()),
                full_name: Some("octo/hello".into()),
                owner: owner("octo"),
                ..Default::default()
            },
        )
        .with_first_commits(
            "octo",
            "hello",
            commits(&["c4", "c3"])
                .with_last("https://api.github.com/repositories/7/commits?page=2"),
        )
        .with_commits(7, 2, commits(&["c2", "c1"]))
        .with_commits(7, 1, commits(&["c4", "c3"]));
    let api = ["c1", "c2", "c3", "c4"].iter().fold(api, |api, sha| {
        api.with_commit(
            "octo",
            "hello",
            sha,
            CommitDetail {
                sha: Some(sha.to_string()),
                ..Default::default()
            },
        )
    });

    let (worker, h) = start(config(true, 0), api).await;
    let summary = run(&worker).await;

    // listing, repo, last page, two commit pages, four commits
    assert_eq!(summary.succeeded, 9);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.deferred, 0);
    assert_eq!(h.store.repo_count(), 1);
    assert_eq!(h.store.commit_count(), 4);
    assert_eq!(h.queue.deferred_count(), 0);
    assert_eq!(worker.dispatcher().in_flight(), 0);
    assert_eq!(worker.dispatcher().pending_completions(), 0);

    // Pages are walked from the last one back to the first
    let pages: Vec<String> = h
        .api
        .calls()
        .into_iter()
        .filter(|p| p.starts_with("/repositories/7/commits"))
        .collect();
    assert_eq!(
        pages,
        vec![
            "/repositories/7/commits?page=2",
            "/repositories/7/commits?page=1"
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_budget_is_never_overspent_on_many_threads() {
    let summaries: Vec<RepoSummary> = (1..=40)
        .map(|i| listed(i, "o", &format!("r{i}"), false))
        .collect();
    let mut api = InMemoryRepositoryApi::new(15).with_repositories(0, Page::new(summaries));
    for i in 1..=40 {
        api = api.with_first_commits("o", &format!("r{i}"), Page::default());
    }

    let (worker, h) = start(config(true, 0), api).await;
    let summary = run(&worker).await;

    assert_eq!(summary.admitted, 15);
    assert_eq!(worker.dispatcher().in_flight(), 0);
    // Every repository that was not admitted is in the queue exactly once
    assert_eq!(h.queue.deferred_count(), 40 - 14);
}

#[tokio::test]
async fn test_refill_drains_deferred_work() {
    let queue = Arc::new(InMemoryDurableStore::new(TaskKind::queue_priority()));
    let mut api = InMemoryRepositoryApi::new(50);
    for i in 0..5 {
        let name = format!("r{i}");
        api = api.with_first_commits("o", &name, Page::default());
        let task = CrawlTask::new(CrawlStep::FetchLastPage {
            repo_id: i,
            owner: "o".into(),
            name,
        });
        queue.enqueue(task.to_deferred().unwrap()).await.unwrap();
    }

    let mut config = config(false, 0);
    config.dequeue_batch_size = 2;
    let (worker, h) = start_with_queue(config, api, queue).await;

    let summary = run(&worker).await;
    assert_eq!(summary.drained, 5);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(h.queue.deferred_count(), 0);
}

#[tokio::test]
async fn test_stop_before_run_defers_everything() {
    let (worker, h) = start(config(true, 0), InMemoryRepositoryApi::new(100)).await;

    let (stop_tx, stop_rx) = watch::channel(false);
    stop_tx.send(true).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(5), worker.run(stop_rx))
        .await
        .unwrap();

    assert_eq!(summary.admitted, 0);
    assert_eq!(worker.dispatcher().gate().remaining(), 0);
    assert_eq!(h.api.calls(), vec!["/rate_limit"]);
}

#[tokio::test]
async fn test_empty_backlog_launches_nobody() {
    let (worker, h) = start(config(false, 0), InMemoryRepositoryApi::new(10)).await;
    assert_eq!(h.queue.worker_ids(), vec!["worker-under-test"]);

    run(&worker).await;
    let report = worker.shutdown().await;

    assert!(report.scaled);
    assert!(report.launched.is_empty());
    assert!(report.connection_released);
    assert!(h.launcher.launched().is_empty());
    assert_eq!(h.queue.fleet_size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_backlog_launches_registered_successors() {
    let (worker, h) = start(config(true, 0), InMemoryRepositoryApi::new(0)).await;
    run(&worker).await;
    assert_eq!(h.queue.deferred_count(), 1);

    let report = worker.shutdown().await;

    assert!(report.scaled);
    assert!((1..=2).contains(&report.launched.len()));
    assert_eq!(h.launcher.launched(), report.launched);

    let mut expected = report.launched.clone();
    expected.sort();
    assert_eq!(h.queue.worker_ids(), expected);
}

#[tokio::test]
async fn test_failed_retirement_still_releases() {
    let (worker, h) = start(config(true, 0), InMemoryRepositoryApi::new(0)).await;
    run(&worker).await;

    h.queue.set_unavailable(true);
    let report = worker.shutdown().await;

    assert!(!report.scaled);
    assert!(report.launched.is_empty());
    assert!(report.connection_released);
    assert!(h.launcher.launched().is_empty());
}
