//! Transfer transaction
//!
//! Moves `amount` from one account to another as one unit of work:
//!
//! 1. insert the transfer record
//! 2. insert the debit entry (`-amount`) for the source
//! 3. insert the credit entry (`+amount`) for the target
//! 4. adjust both balances, lower account id first
//!
//! Step 4 is what keeps concurrent transfers deadlock free. Every
//! transaction takes the two account row locks in ascending id order, no
//! matter which side is debited, so two transfers between the same pair in
//! opposite directions can never each hold the lock the other is waiting on.
//! Each adjustment is relative (`balance = balance + delta`), so there is no
//! read-then-write window for a lost update.
//!
//! Nothing is retried here. Each call creates a new transfer.

use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::Store;
use super::error::LedgerError;
use crate::ledger::{Account, AccountId, CreateEntry, CreateTransfer, Entry, Transfer, queries};

const TRANSFER_FROM_FKEY: &str = "transfers_from_account_id_fkey";
const TRANSFER_TO_FKEY: &str = "transfers_to_account_id_fkey";
const ENTRY_ACCOUNT_FKEY: &str = "entries_account_id_fkey";

/// Input of [`Store::transfer_tx`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

impl TransferTxParams {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Reject inputs that can never succeed, before any write is issued
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= 0 {
            return Err(LedgerError::InvalidAmount(self.amount));
        }
        for id in [self.from_account_id, self.to_account_id] {
            if id <= 0 {
                return Err(LedgerError::InvalidAccountId(id));
            }
        }
        if self.from_account_id == self.to_account_id {
            return Err(LedgerError::SameAccount(self.from_account_id));
        }
        Ok(())
    }
}

/// Everything one transfer wrote, as seen inside its transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    pub from_account: Account,
    pub to_account: Account,
}

/// A relative balance change for one account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceAdjustment {
    pub account_id: AccountId,
    pub delta: i64,
}

/// The two balance adjustments of a transfer, in lock order.
///
/// Always ascending by account id, independent of direction. Every
/// transfer must go through this ordering for the no-deadlock guarantee
/// to hold.
pub fn balance_adjustments(params: &TransferTxParams) -> [BalanceAdjustment; 2] {
    let debit = BalanceAdjustment {
        account_id: params.from_account_id,
        delta: -params.amount,
    };
    let credit = BalanceAdjustment {
        account_id: params.to_account_id,
        delta: params.amount,
    };

    if debit.account_id < credit.account_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}

impl Store {
    /// Atomically transfer `params.amount` between two accounts.
    ///
    /// On any error nothing is committed: no transfer, no entries, no
    /// balance change. The configured transaction timeout, if any, bounds
    /// the writes but not the commit.
    pub async fn transfer_tx(
        &self,
        params: TransferTxParams,
    ) -> Result<TransferTxResult, LedgerError> {
        self.run_transfer(params, std::future::pending()).await
    }

    /// [`Store::transfer_tx`], abandoned if `cancel` completes first.
    ///
    /// If `cancel` wins before the writes finish, the transaction is dropped
    /// uncommitted and [`LedgerError::Cancelled`] is returned. Once the
    /// writes are done `cancel` is ignored and the commit runs to completion.
    pub async fn transfer_tx_cancellable<C>(
        &self,
        params: TransferTxParams,
        cancel: C,
    ) -> Result<TransferTxResult, LedgerError>
    where
        C: Future<Output = ()>,
    {
        self.run_transfer(params, cancel).await
    }

    async fn run_transfer<C>(
        &self,
        params: TransferTxParams,
        cancel: C,
    ) -> Result<TransferTxResult, LedgerError>
    where
        C: Future<Output = ()>,
    {
        params.validate()?;

        let limit = self.config().tx_timeout();
        let abort = async move {
            let err = match limit {
                Some(limit) => tokio::select! {
                    _ = tokio::time::sleep(limit) => LedgerError::Timeout(limit),
                    _ = cancel => LedgerError::Cancelled,
                },
                None => {
                    cancel.await;
                    LedgerError::Cancelled
                }
            };
            debug!(
                from_account_id = params.from_account_id,
                to_account_id = params.to_account_id,
                code = err.code(),
                "Transfer abandoned before commit"
            );
            err
        };

        let started = Instant::now();
        let result = self
            .exec_tx_until(move |conn| Box::pin(apply_transfer(conn, params)), abort)
            .await;

        match &result {
            Ok(r) => info!(
                transfer_id = r.transfer.id,
                from_account_id = params.from_account_id,
                to_account_id = params.to_account_id,
                amount = params.amount,
                elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
                "Transfer committed"
            ),
            Err(e @ LedgerError::CommitOutcomeUnknown(_)) => error!(
                from_account_id = params.from_account_id,
                to_account_id = params.to_account_id,
                amount = params.amount,
                error = %e,
                "Transfer commit outcome unknown"
            ),
            Err(e) => warn!(
                from_account_id = params.from_account_id,
                to_account_id = params.to_account_id,
                amount = params.amount,
                code = e.code(),
                error = %e,
                "Transfer not applied"
            ),
        }

        result
    }
}

async fn apply_transfer(
    conn: &mut PgConnection,
    params: TransferTxParams,
) -> Result<TransferTxResult, LedgerError> {
    let transfer = queries::create_transfer(
        &mut *conn,
        CreateTransfer {
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
        },
    )
    .await
    .map_err(|e| {
        missing_account(
            e,
            &[
                (TRANSFER_FROM_FKEY, params.from_account_id),
                (TRANSFER_TO_FKEY, params.to_account_id),
            ],
        )
    })?;

    let from_entry = queries::create_entry(
        &mut *conn,
        CreateEntry {
            account_id: params.from_account_id,
            amount: -params.amount,
        },
    )
    .await
    .map_err(|e| missing_account(e, &[(ENTRY_ACCOUNT_FKEY, params.from_account_id)]))?;

    let to_entry = queries::create_entry(
        &mut *conn,
        CreateEntry {
            account_id: params.to_account_id,
            amount: params.amount,
        },
    )
    .await
    .map_err(|e| missing_account(e, &[(ENTRY_ACCOUNT_FKEY, params.to_account_id)]))?;

    let [first, second] = balance_adjustments(&params);
    let first = adjust_balance(&mut *conn, first).await?;
    let second = adjust_balance(&mut *conn, second).await?;

    let (from_account, to_account) = if first.id == params.from_account_id {
        (first, second)
    } else {
        (second, first)
    };

    Ok(TransferTxResult {
        transfer,
        from_entry,
        to_entry,
        from_account,
        to_account,
    })
}

/// Apply one relative adjustment. A refused debit becomes
/// [`LedgerError::InsufficientFunds`], a credit past `i64::MAX`
/// [`LedgerError::BalanceOverflow`].
async fn adjust_balance(
    conn: &mut PgConnection,
    adjustment: BalanceAdjustment,
) -> Result<Account, LedgerError> {
    let updated = queries::add_account_balance(&mut *conn, adjustment.account_id, adjustment.delta)
        .await
        .map_err(|e| match LedgerError::from(e) {
            LedgerError::OutOfRange(_) => LedgerError::BalanceOverflow {
                account_id: adjustment.account_id,
                delta: adjustment.delta,
            },
            other => other,
        })?;
    if let Some(account) = updated {
        return Ok(account);
    }

    // No row matched: either the account is gone or the guard refused
    match queries::get_account(&mut *conn, adjustment.account_id).await? {
        None => Err(LedgerError::AccountNotFound(adjustment.account_id)),
        Some(account) => Err(LedgerError::InsufficientFunds {
            account_id: account.id,
            balance: account.balance,
            amount: -adjustment.delta,
        }),
    }
}

/// Map a foreign key violation on one of `fkeys` to the account it names
fn missing_account(err: sqlx::Error, fkeys: &[(&str, AccountId)]) -> LedgerError {
    let err = LedgerError::from(err);
    let account = err.constraint().and_then(|constraint| {
        fkeys
            .iter()
            .find(|(name, _)| *name == constraint)
            .map(|(_, id)| *id)
    });
    match account {
        Some(id) => LedgerError::AccountNotFound(id),
        None => err,
    }
}
