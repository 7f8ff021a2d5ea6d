use anyhow::{Context, Result};
use repocrawl_worker::telemetry::{init_telemetry, TelemetryConfig};
use repocrawl_worker::{CrawlWorker, WorkerConfig};
use tokio::sync::watch;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "repocrawl_worker=info")
    let telemetry_config = TelemetryConfig::from_env();
    init_telemetry(telemetry_config);

    tracing::info!("repocrawl-worker starting...");

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;

    tracing::info!(
        worker_id = %config.worker_id,
        github_api = %config.github_api,
        initial_crawl = config.initial_crawl,
        max_workers = config.max_workers,
        "Starting crawl worker"
    );

    let worker = CrawlWorker::connect(config)
        .await
        .context("Failed to start crawl worker")?;

    // Ctrl-C stops admission; in-flight tasks still finish and shutdown still scales
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = stop_tx.send(true);
        }
    });

    let summary = worker.run(stop_rx).await;
    tracing::info!(
        admitted = summary.admitted,
        deferred = summary.deferred,
        succeeded = summary.succeeded,
        failed = summary.failed,
        redeferred = summary.redeferred,
        drained = summary.drained,
        "Run finished"
    );

    let report = worker.shutdown().await;
    tracing::info!(
        launched = report.launched.len(),
        scaled = report.scaled,
        "Worker shutdown complete"
    );
    Ok(())
}
