//! Ledger store
//!
//! [`Store`] owns the connection pool and runs every multi-row operation
//! through [`Store::exec_tx`]. The transfer transaction lives in
//! [`transfer`].

pub mod error;
pub mod retry;
pub mod transfer;
pub mod tx;

pub use error::LedgerError;
pub use retry::{RetryPolicy, retry_transient};
pub use transfer::{BalanceAdjustment, TransferTxParams, TransferTxResult, balance_adjustments};
pub use tx::IsolationLevel;

use sqlx::PgPool;

use crate::config::StoreConfig;
use crate::db::Database;
use crate::ledger::{Account, AccountId, Entry, Transfer, queries};

/// Shared handle to the ledger. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
    config: StoreConfig,
}

impl Store {
    /// Create a store with default settings (`READ COMMITTED`, no timeout)
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, StoreConfig::default())
    }

    pub fn with_config(pool: PgPool, config: StoreConfig) -> Self {
        Self { pool, config }
    }

    pub fn from_database(db: &Database, config: StoreConfig) -> Self {
        Self::with_config(db.pool().clone(), config)
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.config.isolation_level = level;
        self
    }

    /// Bound the unit of work of each transfer. Sub-millisecond remainders
    /// are dropped and durations past `u64::MAX` ms saturate.
    pub fn with_tx_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.config.tx_timeout_ms =
            timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.config.isolation_level
    }

    /// Open a new account. Setup helper; not part of the transfer path.
    pub async fn create_account(&self, balance: i64) -> Result<Account, LedgerError> {
        Ok(queries::create_account(&self.pool, balance).await?)
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(queries::get_account(&self.pool, id).await?)
    }

    pub async fn get_entry(&self, id: i64) -> Result<Option<Entry>, LedgerError> {
        Ok(queries::get_entry(&self.pool, id).await?)
    }

    pub async fn get_transfer(&self, id: i64) -> Result<Option<Transfer>, LedgerError> {
        Ok(queries::get_transfer(&self.pool, id).await?)
    }
}
