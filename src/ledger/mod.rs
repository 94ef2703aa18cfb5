//! Ledger store
//!
//! PostgreSQL-backed rows for accounts, entries and transfers, and the
//! single-statement operations on them.

pub mod models;
pub mod queries;

pub use models::{Account, AccountId, CreateEntry, CreateTransfer, Entry, Transfer};
