use anyhow::Context;
use sqlx::PgPool;

use storefront_infra::store::postgres::migrate;
use storefront_infra::{
    ExpirySweeper, PostgresCartLineStore, PostgresStockStore, ReservationConfig, ReservationLedger,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    storefront_observability::init();

    let config = ReservationConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    migrate(&pool).await.context("failed to apply reservation schema")?;

    let ledger = ReservationLedger::new(
        PostgresStockStore::new(pool.clone()),
        PostgresCartLineStore::new(pool),
    )
    .with_config(config.ledger_config());

    tracing::info!(
        interval_secs = config.sweep_interval_secs,
        batch_size = config.sweep_batch_size,
        hold_secs = config.hold_secs,
        "starting expiry sweeper"
    );
    let handle = ExpirySweeper::spawn(ledger, config.sweep_interval());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    let stats = handle.shutdown().await;
    tracing::info!(
        passes = stats.passes,
        lines_released = stats.lines_released,
        units_released = stats.units_released,
        line_failures = stats.line_failures,
        "expiry sweeper exited"
    );

    Ok(())
}
