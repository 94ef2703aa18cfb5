//! bank_ledger bootstrap
//!
//! Loads `config/<env>.yaml`, sets up logging, connects to PostgreSQL,
//! applies the ledger schema when `postgres.run_migrations` is set and
//! verifies the store is reachable.
//!
//! ```text
//! bank_ledger [--env dev]
//! ```

use anyhow::Context;
use bank_ledger::{AppConfig, Database, Store};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _guard = bank_ledger::logging::init_logging(&config);

    tracing::info!(env = %env, "Starting bank_ledger");

    let db = Database::connect_with(&config.postgres)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.health_check().await.context("Health check failed")?;

    let store = Store::from_database(&db, config.store.clone());
    tracing::info!(
        isolation_level = %store.isolation_level(),
        tx_timeout_ms = ?config.store.tx_timeout_ms,
        "Ledger store ready"
    );

    Ok(())
}
