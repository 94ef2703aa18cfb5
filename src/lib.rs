//! bank_ledger - Atomic transfers on a PostgreSQL ledger
//!
//! Moves money between accounts as one transaction that records a transfer,
//! two balancing entries and two balance updates, safe under any number of
//! concurrent callers.
//!
//! # Modules
//!
//! - [`ledger`] - Account / Entry / Transfer rows and single-statement queries
//! - [`store`] - Transaction executor and the transfer transaction
//! - [`db`] - Connection pool and embedded migrations
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod store;

// Convenient re-exports at crate root
pub use config::{AppConfig, PostgresConfig, StoreConfig};
pub use db::Database;
pub use ledger::{Account, AccountId, Entry, Transfer};
pub use store::{
    IsolationLevel, LedgerError, RetryPolicy, Store, TransferTxParams, TransferTxResult,
    retry_transient,
};
