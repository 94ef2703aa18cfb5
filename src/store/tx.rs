//! Transaction executor
//!
//! Runs a unit of work inside one database transaction: commit on `Ok`,
//! rollback on `Err`. Dropping the future before commit drops the
//! transaction, which sqlx rolls back when the connection returns to the pool.
//!
//! An abort future (deadline, caller cancellation) only races the unit of
//! work. Once COMMIT is sent it runs to completion, so an abort error always
//! means nothing was applied.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::fmt;
use std::future::Future;

use super::Store;
use super::error::LedgerError;

/// Isolation level applied to every transaction the store opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// PostgreSQL default. Relative balance updates re-read the latest
    /// committed row after waiting on its lock, so concurrent transfers
    /// serialize instead of failing.
    #[default]
    ReadCommitted,
    /// Concurrent updates of the same row fail with 40001 and need a
    /// caller-side retry.
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    fn set_transaction_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl Store {
    /// Execute `work` inside a new transaction.
    ///
    /// `work` receives the transaction's connection; every query it issues
    /// through that connection becomes visible to others only on commit.
    /// On error the transaction is rolled back and the error returned
    /// unchanged. If the rollback itself fails, the original error is
    /// wrapped in [`LedgerError::RollbackFailed`].
    pub async fn exec_tx<T, F>(&self, work: F) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, LedgerError>> + Send,
    {
        self.exec_tx_until(work, std::future::pending()).await
    }

    /// [`Store::exec_tx`], abandoned if `abort` completes before the unit of
    /// work does.
    ///
    /// The error `abort` yields is returned and the transaction is dropped
    /// uncommitted. `abort` is not polled once the work has finished, so a
    /// slow COMMIT is never reported as aborted.
    pub async fn exec_tx_until<T, F, A>(&self, work: F, abort: A) -> Result<T, LedgerError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, LedgerError>> + Send,
        A: Future<Output = LedgerError>,
    {
        tokio::pin!(abort);
        let isolation = self.isolation_level();

        let mut tx = tokio::select! {
            biased;
            err = &mut abort => return Err(err),
            tx = self.pool().begin() => tx?,
        };

        // Outer `Err`: aborted before the work finished
        let outcome = tokio::select! {
            biased;
            err = &mut abort => Err(err),
            result = async {
                sqlx::query(isolation.set_transaction_sql())
                    .execute(&mut *tx)
                    .await?;
                work(&mut *tx).await
            } => Ok(result),
        };

        match outcome {
            Err(aborted) => {
                // The abandoned statement may still be running; the
                // rollback is queued behind it when the connection returns.
                drop(tx);
                tracing::debug!(code = aborted.code(), "Transaction abandoned before commit");
                Err(aborted)
            }
            Ok(Ok(value)) => {
                tx.commit().await.map_err(LedgerError::from_commit)?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(
                        error = %err,
                        rollback_error = %rollback,
                        "Transaction rollback failed"
                    );
                    return Err(LedgerError::RollbackFailed {
                        source: Box::new(err),
                        rollback,
                    });
                }
                tracing::debug!(code = err.code(), "Transaction rolled back");
                Err(err)
            }
        }
    }
}
