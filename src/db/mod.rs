//! Database connection management

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::PostgresConfig;

/// Embedded ledger schema (`migrations/`)
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool with default pool settings
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::connect_with(&PostgresConfig::new(database_url)).await
    }

    /// Create a new database connection pool from config, applying
    /// migrations when `run_migrations` is set
    pub async fn connect_with(config: &PostgresConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );

        let db = Self { pool };
        if config.run_migrations {
            db.migrate().await?;
        }
        Ok(db)
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        MIGRATOR.run(&self.pool).await?;
        tracing::info!("Ledger schema migrations applied");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
