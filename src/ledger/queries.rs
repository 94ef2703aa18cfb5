//! Single-statement ledger operations
//!
//! Every function takes any [`PgExecutor`], so the same query runs against
//! the pool or inside a transaction (`&mut *tx`).

use sqlx::PgExecutor;

use super::models::{Account, AccountId, CreateEntry, CreateTransfer, Entry, Transfer};

/// Insert a new account with an opening balance
pub async fn create_account<'e, E>(executor: E, balance: i64) -> Result<Account, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Account>(
        r#"INSERT INTO accounts (balance) VALUES ($1)
           RETURNING id, balance, created_at"#,
    )
    .bind(balance)
    .fetch_one(executor)
    .await
}

pub async fn get_account<'e, E>(executor: E, id: AccountId) -> Result<Option<Account>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Account>(r#"SELECT id, balance, created_at FROM accounts WHERE id = $1"#)
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Atomically add `delta` to an account balance.
///
/// The adjustment is relative (`balance = balance + delta`) and is refused
/// when it would leave the balance negative. Returns `None` when no row
/// matched: either the account does not exist or the guard refused the
/// update. Takes the row lock for the rest of the enclosing transaction.
pub async fn add_account_balance<'e, E>(
    executor: E,
    id: AccountId,
    delta: i64,
) -> Result<Option<Account>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Account>(
        r#"
        UPDATE accounts
        SET balance = balance + $2
        WHERE id = $1 AND balance + $2 >= 0
        RETURNING id, balance, created_at
        "#,
    )
    .bind(id)
    .bind(delta)
    .fetch_optional(executor)
    .await
}

pub async fn create_entry<'e, E>(executor: E, entry: CreateEntry) -> Result<Entry, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Entry>(
        r#"INSERT INTO entries (account_id, amount) VALUES ($1, $2)
           RETURNING id, account_id, amount, created_at"#,
    )
    .bind(entry.account_id)
    .bind(entry.amount)
    .fetch_one(executor)
    .await
}

pub async fn get_entry<'e, E>(executor: E, id: i64) -> Result<Option<Entry>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Entry>(
        r#"SELECT id, account_id, amount, created_at FROM entries WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

pub async fn create_transfer<'e, E>(
    executor: E,
    transfer: CreateTransfer,
) -> Result<Transfer, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Transfer>(
        r#"
        INSERT INTO transfers (from_account_id, to_account_id, amount)
        VALUES ($1, $2, $3)
        RETURNING id, from_account_id, to_account_id, amount, created_at
        "#,
    )
    .bind(transfer.from_account_id)
    .bind(transfer.to_account_id)
    .bind(transfer.amount)
    .fetch_one(executor)
    .await
}

pub async fn get_transfer<'e, E>(executor: E, id: i64) -> Result<Option<Transfer>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Transfer>(
        r#"SELECT id, from_account_id, to_account_id, amount, created_at
           FROM transfers WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Count entries and transfers referencing an account. Used to verify that
/// failed transfers left nothing behind.
pub async fn count_account_records<'e, E>(
    executor: E,
    id: AccountId,
) -> Result<(i64, i64), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, (i64, i64)>(
        r#"
        SELECT
            (SELECT COUNT(*) FROM entries WHERE account_id = $1),
            (SELECT COUNT(*) FROM transfers WHERE from_account_id = $1 OR to_account_id = $1)
        "#,
    )
    .bind(id)
    .fetch_one(executor)
    .await
}
