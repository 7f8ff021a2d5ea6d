// Crawl worker lifecycle
// Decision: One worker = one process = one pool; the pool closes only after audit writes drain
// Decision: The call budget is read once at boot from the upstream rate limit
// Decision: Refill from the deferred queue only while budget remains

use std::sync::Arc;

use repocrawl_durable::{
    AdmissionGate, Autoscaler, ComputeLauncher, DeferredQueue, FleetRegistry, LaunchError,
    PostgresDurableStore, StoreError, WriteTracker,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::config::WorkerConfig;
use crate::dispatcher::{log_stats, Dispatcher, Origin};
use crate::github::{ApiError, GithubClient, RepositoryApi};
use crate::handlers::CrawlLimits;
use crate::launcher::launcher_for;
use crate::store::{CrawlStore, PostgresCrawlStore};
use crate::task::{CrawlTask, TaskKind};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Errors that stop a worker from starting
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to connect to database: {0}")]
    Connect(String),

    #[error("failed to run migrations: {0}")]
    Migrate(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Collaborators a worker runs against
pub struct WorkerParts {
    pub queue: Arc<dyn DeferredQueue>,
    pub fleet: Arc<dyn FleetRegistry>,
    pub api: Arc<dyn RepositoryApi>,
    pub store: Arc<dyn CrawlStore>,
    pub launcher: Arc<dyn ComputeLauncher>,
    pub audit: AuditLog,
}

/// What a run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub admitted: u64,
    pub deferred: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub redeferred: u64,
    pub drained: u64,
}

/// What shutdown did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Ids of successors launched
    pub launched: Vec<String>,

    /// Whether the retirement transaction committed
    pub scaled: bool,

    /// Whether every resource was released after the write drain
    pub connection_released: bool,
}

// =============================================================================
// CrawlWorker
// =============================================================================

/// A single short-lived crawl worker
pub struct CrawlWorker {
    config: WorkerConfig,
    pool: Option<PgPool>,
    fleet: Arc<dyn FleetRegistry>,
    dispatcher: Arc<Dispatcher>,
    autoscaler: Autoscaler,
}

impl CrawlWorker {
    /// Connect to PostgreSQL and the upstream API and register in the fleet
    pub async fn connect(config: WorkerConfig) -> Result<Self, WorkerError> {
        info!(
            worker_id = %config.worker_id,
            max_connections = config.db_max_connections,
            "connecting worker"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| WorkerError::Connect(e.to_string()))?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| WorkerError::Migrate(e.to_string()))?;

        let durable = Arc::new(PostgresDurableStore::new(
            pool.clone(),
            TaskKind::queue_priority(),
        ));
        let writes = WriteTracker::new();
        let audit = if config.audit_log {
            AuditLog::new(pool.clone(), config.worker_id.clone(), writes)
        } else {
            AuditLog::disabled(config.worker_id.clone(), writes)
        };

        let parts = WorkerParts {
            queue: durable.clone(),
            fleet: durable,
            api: Arc::new(GithubClient::new(
                &config.github_api,
                config.github_token.as_deref(),
            )?),
            store: Arc::new(PostgresCrawlStore::new(pool.clone())),
            launcher: launcher_for(&config)?,
            audit,
        };

        let mut worker = Self::start(config, parts).await?;
        worker.pool = Some(pool);
        Ok(worker)
    }

    /// Register and size the budget from the upstream rate limit
    ///
    /// When the rate limit cannot be read the budget is zero and every task
    /// is deferred.
    pub async fn start(config: WorkerConfig, parts: WorkerParts) -> Result<Self, WorkerError> {
        parts.fleet.register_worker(&config.worker_id).await?;

        let budget = match parts.api.rate_limit().await {
            Ok(rate) => rate.remaining,
            Err(e) => {
                warn!(error = %e, "could not read rate limit, deferring all work");
                0
            }
        };
        info!(worker_id = %config.worker_id, budget, "worker registered");

        let gate = Arc::new(AdmissionGate::new(parts.queue.clone(), budget));
        let dispatcher = Arc::new(Dispatcher::new(
            gate,
            parts.queue,
            parts.api,
            parts.store,
            parts.audit,
            CrawlLimits {
                max_repos: config.max_repos,
                max_commits: config.max_commits,
            },
        ));
        let autoscaler = Autoscaler::new(parts.launcher, config.max_workers);

        Ok(Self {
            config,
            pool: None,
            fleet: parts.fleet,
            dispatcher,
            autoscaler,
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn refill_watermark(&self) -> usize {
        (self.config.dequeue_batch_size / 2).max(1)
    }

    fn refill_size(&self) -> usize {
        let remaining = usize::try_from(self.dispatcher.gate().remaining()).unwrap_or(0);
        remaining.min(self.config.dequeue_batch_size)
    }

    /// Run until quiescent
    ///
    /// Quiescent means nothing is in flight and either a stop was requested,
    /// the budget is spent, or the queue had nothing left to claim.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> RunSummary {
        let gate = self.dispatcher.gate();
        let mut stopping = *stop.borrow();
        let mut stop_closed = false;
        if stopping {
            gate.exhaust();
        }

        info!(
            worker_id = %self.config.worker_id,
            budget = gate.remaining(),
            initial_crawl = self.config.initial_crawl,
            "worker running"
        );

        if self.config.initial_crawl && !stopping {
            let seed = CrawlTask::bootstrap(self.config.start_repo);
            info!(id = %seed.id(), since = self.config.start_repo, "seeding initial crawl");
            // Nothing waits on the root; its tree finishes on its own
            drop(self.dispatcher.submit(seed, Origin::Seed).await);
        }

        let mut queue_empty = false;
        loop {
            let in_flight = self.dispatcher.in_flight();
            let can_refill = !stopping && gate.has_budget();

            if can_refill && (in_flight == 0 || (in_flight < self.refill_watermark() && !queue_empty))
            {
                let claimed = self.dispatcher.refill(self.refill_size()).await;
                queue_empty = claimed == 0;
                if claimed > 0 || self.dispatcher.in_flight() > 0 {
                    continue;
                }
            }

            if self.dispatcher.in_flight() == 0 {
                break;
            }

            tokio::select! {
                _ = self.dispatcher.activity() => {}
                changed = stop.changed(), if !stop_closed => match changed {
                    Ok(()) if *stop.borrow() => {
                        info!("stop requested, deferring remaining work");
                        stopping = true;
                        stop_closed = true;
                        gate.exhaust();
                    }
                    Ok(()) => {}
                    Err(_) => stop_closed = true,
                },
            }
        }

        let stats = self.dispatcher.stats();
        log_stats(&stats);

        RunSummary {
            admitted: gate.admitted_count(),
            deferred: gate.deferred_count(),
            succeeded: stats.succeeded,
            failed: stats.failed,
            redeferred: stats.redeferred,
            drained: stats.drained,
        }
    }

    /// Retire from the fleet, launch successors and release the pool
    ///
    /// Never fails: a failed retirement is logged and audited, and the pool
    /// is released regardless.
    pub async fn shutdown(self) -> ShutdownReport {
        let audit = self.dispatcher.audit().clone();
        let worker_id = self.config.worker_id.as_str();

        let (launched, scaled) = match self.fleet.retire_worker(worker_id, &self.autoscaler).await
        {
            Ok(outcome) => {
                for id in &outcome.launched {
                    audit.record_spawn(id).await;
                }
                info!(
                    backlog = outcome.snapshot.backlog,
                    fleet_size = outcome.snapshot.fleet_size,
                    launched = outcome.launched.len(),
                    "worker retired"
                );
                (outcome.launched, true)
            }
            Err(e) => {
                error!(error = %e, "retirement failed, no successors launched");
                audit.record_shutdown_error(&e.to_string()).await;
                if let Err(e) = self.fleet.deregister_worker(worker_id).await {
                    warn!(error = %e, "could not deregister worker");
                }
                (Vec::new(), false)
            }
        };

        audit.writes().wait_idle().await;
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        info!(worker_id, "connection released");

        ShutdownReport {
            launched,
            scaled,
            connection_released: audit.writes().outstanding() == 0,
        }
    }
}

