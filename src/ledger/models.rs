//! Row types for the ledger tables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Account identifier (`accounts.id`)
pub type AccountId = i64;

/// A balance-holding account. The only mutable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: AccountId,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

/// One signed ledger line: negative for a debit, positive for a credit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Entry {
    pub id: i64,
    pub account_id: AccountId,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Record of one completed movement of funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateEntry {
    pub account_id: AccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransfer {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}
