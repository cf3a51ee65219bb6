//! Vigil - Entry Point
//!
//! Starts the check scheduler and the optional source refresh loop with
//! graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil::config::{Config, LogConfig};
use vigil::error::Result;
use vigil::metrics::ProxyMetrics;
use vigil::proxy::{ProxyChecker, StableSelector};
use vigil::services::{
    load_descriptors, CheckScheduler, ShutdownHandle, SourceRefreshService, SubscriptionPublisher,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!(
        method = %config.checker.method,
        concurrency = config.checker.concurrency,
        "Starting Vigil"
    );

    let proxies = match load_descriptors(&config.source.proxies_file).await {
        Ok(proxies) => proxies,
        Err(e) => {
            warn!(
                "Failed to load {}: {} (starting with an empty set)",
                config.source.proxies_file.display(),
                e
            );
            Vec::new()
        }
    };
    info!("Loaded {} proxies", proxies.len());

    let metrics = Arc::new(ProxyMetrics::new(&config.publish.metrics_instance)?);
    let checker = Arc::new(ProxyChecker::new(&config.checker, proxies)?.with_metrics(metrics.clone()));
    let publisher = Arc::new(
        SubscriptionPublisher::new(
            checker.clone(),
            StableSelector::new(config.selector.clone()),
            config.publish.clone(),
        )
        .with_metrics(metrics),
    );
    let scheduler = Arc::new(CheckScheduler::new(
        checker.clone(),
        publisher.clone(),
        config.checker.check_interval,
    ));

    if config.run_once {
        match scheduler.run_iteration().await {
            Some(report) => info!(
                online = report.online,
                offline = report.offline,
                "Single check completed"
            ),
            None => warn!("Single check skipped"),
        }
        print!("{}", publisher.render_latest());
        return Ok(());
    }

    let (handle, scheduler_shutdown) = ShutdownHandle::new();
    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(scheduler_shutdown).await }
    });

    let refresh_task = config.source.refresh_interval.map(|refresh_interval| {
        let service = SourceRefreshService::new(
            checker.clone(),
            config.source.proxies_file.clone(),
            refresh_interval,
        );
        let shutdown = handle.subscribe();
        tokio::spawn(async move { service.run(shutdown).await })
    });

    shutdown_signal().await;
    info!("Shutdown signal received");
    handle.shutdown();

    if let Err(e) = scheduler_task.await {
        error!("Check scheduler task failed: {}", e);
    }
    if let Some(task) = refresh_task {
        if let Err(e) = task.await {
            error!("Source refresh task failed: {}", e);
        }
    }

    info!("Vigil stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("vigil={}", log.level).into());

    if log.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
