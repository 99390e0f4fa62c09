use anyhow::Context;
use split_proxy::cache::SurrogateCache;
use split_proxy::config::Cli;
use split_proxy::error::{StartupError, EXIT_SUCCESS};
use split_proxy::queue::TelemetryQueue;
use split_proxy::segments::SegmentStore;
use split_proxy::splits::SplitStore;
use split_proxy::sync::{SyncConfig, Synchronizer};
use split_proxy::upstream::{HttpFetcher, UpstreamFetcher};
use split_proxy::{logging, metrics, App};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::install();

    let cli = match Cli::load() {
        Ok(cli) => cli,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            std::process::exit(StartupError::Config(err).exit_code());
        }
    };

    if let Some(path) = &cli.write_default_conf {
        write_default_conf(path, &cli)?;
        return Ok(());
    }

    tracing::info!("starting split-proxy");

    let recorder = metrics::install_recorder();

    let fetcher: Arc<dyn UpstreamFetcher> = Arc::new(
        HttpFetcher::new(
            cli.upstream_url.clone(),
            cli.apikey.clone(),
            cli.upstream_timeout,
        )
        .context("building upstream client")?,
    );

    let splits = Arc::new(SplitStore::default());
    let segments = Arc::new(SegmentStore::default());
    let cache = Arc::new(SurrogateCache::new(cli.cache_ttl, cli.cache_max_entries));
    let impressions = Arc::new(TelemetryQueue::new(
        "impressions",
        cli.impressions_queue_size,
    ));
    let events = Arc::new(TelemetryQueue::new("events", cli.events_queue_size));

    let sync_config = SyncConfig {
        split_refresh: cli.split_refresh_rate,
        segment_refresh: cli.segment_refresh_rate,
        segment_worker_count: cli.segment_worker_count,
        telemetry_push_interval: cli.telemetry_push_interval,
        impressions_batch_size: 500,
        events_batch_size: 500,
        impressions_mode: cli.impressions_mode,
    };

    let synchronizer = Arc::new(Synchronizer::new(
        splits.clone(),
        segments.clone(),
        cache.clone(),
        impressions.clone(),
        events.clone(),
        Arc::new(split_proxy::eviction::EvictionCalculator::new(
            split_proxy::eviction::DEFAULT_RING_SIZE,
            500.0,
        )),
        Arc::new(split_proxy::eviction::EvictionCalculator::new(
            split_proxy::eviction::DEFAULT_RING_SIZE,
            500.0,
        )),
        fetcher.clone(),
        sync_config,
    ));

    let app = Arc::new(App {
        splits,
        segments,
        cache,
        impressions,
        events,
        fetcher,
        synchronizer: synchronizer.clone(),
        lifecycle: split_proxy::lifecycle::Lifecycle::new(),
    });

    if let Err(err) = app.lifecycle.run_initial_sync(&synchronizer).await {
        tracing::error!(error = %err, "initial synchronization failed");
        std::process::exit(err.exit_code());
    }

    let cancel_token = CancellationToken::new();
    synchronizer.spawn_periodic_tasks(cancel_token.clone());

    let controller_router = split_proxy::controller::build_router(app.clone());
    let admin_router = metrics::build_router(recorder);

    let controller_listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("binding SDK-facing listener on {}:{}", cli.host, cli.port))?;
    let admin_listener = tokio::net::TcpListener::bind((cli.admin_host.as_str(), cli.admin_port))
        .await
        .with_context(|| {
            format!(
                "binding admin listener on {}:{}",
                cli.admin_host, cli.admin_port
            )
        })?;

    tracing::info!(addr = %controller_listener.local_addr()?, "SDK-facing listener bound");
    tracing::info!(addr = %admin_listener.local_addr()?, "admin listener bound");

    let controller_shutdown = cancel_token.clone();
    let controller_task = tokio::spawn(async move {
        axum::serve(controller_listener, controller_router)
            .with_graceful_shutdown(async move { controller_shutdown.cancelled().await })
            .await
    });

    let admin_shutdown = cancel_token.clone();
    let admin_task = tokio::spawn(async move {
        axum::serve(admin_listener, admin_router)
            .with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight telemetry");
    app.lifecycle
        .shutdown(&synchronizer, &cancel_token, cli.shutdown_grace_period)
        .await;

    let _ = tokio::join!(controller_task, admin_task);

    std::process::exit(EXIT_SUCCESS);
}

fn write_default_conf(path: &std::path::Path, cli: &Cli) -> anyhow::Result<()> {
    let defaults = split_proxy::config::FileConfig::from(cli);
    let json = serde_json::to_string_pretty(&defaults)?;
    std::fs::write(path, json)
        .with_context(|| format!("writing default configuration to {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote default configuration");
    Ok(())
}

/// Waits for either Ctrl+C or, on Unix, `SIGTERM` (the two signals a
/// container orchestrator is expected to send on shutdown).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
