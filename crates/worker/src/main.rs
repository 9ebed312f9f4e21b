//! Long-running worker hosting bill controllers against the Postgres ledger.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use billflow_core::SystemClock;
use billflow_events::InMemoryEventRouter;
use billflow_infra::ledger_store::PostgresLedgerStore;
use billflow_infra::{BillingConfig, BillingRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    billflow_observability::init();

    let config = BillingConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to the ledger database")?;

    let store = PostgresLedgerStore::new(pool);
    store.migrate().await.context("failed to apply ledger schema")?;

    let runtime = BillingRuntime::new(
        store,
        Arc::new(InMemoryEventRouter::new(config.mailbox_capacity)),
        Arc::new(SystemClock),
        &config,
    );

    let resumed = runtime
        .recover()
        .await
        .context("failed to resume open bills")?;
    tracing::info!(resumed, "billing worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    let reports = runtime.shutdown().await;
    let open = reports.iter().filter(|r| r.bill.is_open()).count();
    tracing::info!(stopped = reports.len(), open, "billing worker stopped");

    Ok(())
}
