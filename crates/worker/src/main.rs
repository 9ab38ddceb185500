use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chorus_core::clock::{Clock, SystemClock};
use chorus_db::PgStore;
use chorus_economy::TokenEconomy;
use chorus_events::{EventBus, TransitionLogger};
use chorus_provider::{ContributionSource, FixedContribution, HttpContributionSource, HttpGenerationProvider};
use chorus_queue::JobQueue;
use chorus_worker::config::{LogFormat, WorkerConfig};
use chorus_worker::{Admission, DailyScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    // --- Tracing ---
    let json = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chorus_worker=debug,chorus_queue=debug,chorus_economy=debug,chorus_events=info".into()
            }),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
    tracing::info!(
        concurrency = config.queue.concurrency,
        max_attempts = config.queue.max_attempts,
        rotation_hour = config.rotation_hour,
        "Loaded worker configuration",
    );

    // --- Database ---
    let pool = chorus_db::create_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    chorus_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    chorus_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let store = Arc::new(PgStore::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::default());
    let logger_handle = tokio::spawn(TransitionLogger::run(event_bus.subscribe()));

    // --- Adapters ---
    let mut provider = HttpGenerationProvider::new(&config.provider_url);
    if let Some(key) = &config.provider_api_key {
        provider = provider.with_api_key(key);
    }
    let contributions: Arc<dyn ContributionSource> = match &config.contribution_url {
        Some(url) => Arc::new(HttpContributionSource::new(url)),
        None => {
            tracing::warn!("CONTRIBUTION_URL not set, pools get no contribution share");
            Arc::new(FixedContribution::default())
        }
    };

    // --- Engines ---
    let economy = Arc::new(TokenEconomy::new(
        store.clone(),
        store.clone(),
        contributions,
        Arc::clone(&clock),
        config.economy,
    ));
    let queue = Arc::new(JobQueue::new(
        store,
        Arc::new(provider),
        Arc::clone(&event_bus),
        Arc::clone(&clock),
        config.queue.clone(),
    ));
    // Entry point for submitters; dropped at shutdown with the queue.
    let admission = Admission::new(
        Arc::clone(&economy),
        Arc::clone(&queue),
        Arc::clone(&clock),
        config.calendar,
        config.priority_policy(),
    );
    tracing::info!(default_priority = config.default_priority, "Admission ready");

    let scheduler = DailyScheduler::new(
        economy,
        clock,
        config.calendar,
        config.rotation_hour,
        config.scheduler_interval,
    );

    // --- Background services ---
    let cancel = CancellationToken::new();
    let queue_handle = tokio::spawn(Arc::clone(&queue).run(cancel.clone()));
    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone()));
    tracing::info!("Worker services started (queue, daily scheduler, transition logger)");

    shutdown_signal().await?;

    // --- Shutdown ---
    cancel.cancel();
    if let Err(e) = queue_handle.await {
        tracing::error!(error = %e, "Job queue task panicked");
    }
    tracing::info!("Job queue stopped");
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Daily scheduler task panicked");
    }
    tracing::info!("Daily scheduler stopped");

    // Dropping the last senders closes the bus and lets the logger drain.
    drop(admission);
    drop(queue);
    drop(event_bus);
    if let Err(e) = logger_handle.await {
        tracing::error!(error = %e, "Transition logger task panicked");
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to install Ctrl-C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<anyhow::Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        result = terminate => {
            result?;
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
    Ok(())
}
