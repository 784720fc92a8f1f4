use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orders_analytics_service::config::Config;
use orders_analytics_service::services::cdc::{
    CdcConsumer, MutationApplier, PgOrderStore, RetryPolicy,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orders_analytics_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(
        brokers = %config.kafka.bootstrap_servers,
        topic = %config.kafka.topic,
        group = %config.kafka.group_id,
        "starting orders-analytics-service"
    );

    let pool = config
        .store
        .connect()
        .await
        .context("failed to connect to the analytics store")?;

    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let applier = MutationApplier::new(PgOrderStore::new(pool.clone()));
    let retry = RetryPolicy::new(config.store.max_retries);
    let consumer = CdcConsumer::new(&config.kafka, applier, retry)
        .context("failed to subscribe to the CDC topic")?;

    let result = consumer.run(shutdown_signal()).await;

    // Release both handles on every exit path, fatal errors included.
    drop(consumer);
    pool.close().await;
    tracing::info!("orders-analytics-service stopped");

    result.context("consumer loop failed")
}

/// Resolve on SIGINT or SIGTERM so the loop can drain cleanly.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    }
}
