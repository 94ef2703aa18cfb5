//! Ledger Error Types

use std::time::Duration;
use thiserror::Error;

use crate::ledger::AccountId;

/// Errors surfaced by the store and the transfer transaction.
///
/// Every failure except [`LedgerError::CommitOutcomeUnknown`] means the
/// transfer was not applied.
#[derive(Error, Debug)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero (got {0})")]
    InvalidAmount(i64),

    #[error("Invalid account id: {0}")]
    InvalidAccountId(AccountId),

    #[error("Source and target account cannot be the same: {0}")]
    SameAccount(AccountId),

    // === Constraint Errors ===
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Insufficient funds in account {account_id}: balance {balance}, requested {amount}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: i64,
        amount: i64,
    },

    #[error("Balance of account {account_id} out of range after adding {delta}")]
    BalanceOverflow { account_id: AccountId, delta: i64 },

    #[error("Value out of range: {0}")]
    OutOfRange(#[source] sqlx::Error),

    #[error("Constraint {constraint} violated: {source}")]
    Constraint {
        constraint: String,
        #[source]
        source: sqlx::Error,
    },

    // === Transient Errors ===
    #[error("Transient database error: {0}")]
    Transient(#[source] sqlx::Error),

    // === Cancellation ===
    #[error("Transaction cancelled before commit")]
    Cancelled,

    #[error("Transaction timed out after {0:?}")]
    Timeout(Duration),

    // === System Errors ===
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// The connection failed while COMMIT was in flight. The server may
    /// have applied it; re-read before acting again.
    #[error("Commit outcome unknown: {0}")]
    CommitOutcomeUnknown(#[source] sqlx::Error),

    #[error("{source}; rollback also failed: {rollback}")]
    RollbackFailed {
        source: Box<LedgerError>,
        rollback: sqlx::Error,
    },
}

impl LedgerError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidAccountId(_) => "INVALID_ACCOUNT_ID",
            LedgerError::SameAccount(_) => "SAME_ACCOUNT",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::BalanceOverflow { .. } => "BALANCE_OVERFLOW",
            LedgerError::OutOfRange(_) => "OUT_OF_RANGE",
            LedgerError::Constraint { .. } => "CONSTRAINT_VIOLATION",
            LedgerError::Transient(_) => "TRANSIENT",
            LedgerError::Cancelled => "CANCELLED",
            LedgerError::Timeout(_) => "TIMEOUT",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::CommitOutcomeUnknown(_) => "COMMIT_OUTCOME_UNKNOWN",
            LedgerError::RollbackFailed { source, .. } => source.code(),
        }
    }

    /// Errors rejected before any write was issued
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount(_)
                | LedgerError::InvalidAccountId(_)
                | LedgerError::SameAccount(_)
        )
    }

    /// Whether a caller may reasonably re-run the same operation.
    ///
    /// Only the transient class qualifies: serialization failures, detected
    /// deadlocks, lock timeouts and connections lost before commit. A lost
    /// connection during commit is [`LedgerError::CommitOutcomeUnknown`]
    /// and never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Transient(_) => true,
            LedgerError::RollbackFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Name of the violated constraint, if this is a constraint error
    pub fn constraint(&self) -> Option<&str> {
        match self {
            LedgerError::Constraint { constraint, .. } => Some(constraint),
            _ => None,
        }
    }
}

/// SQLSTATEs worth retrying: serialization_failure, deadlock_detected,
/// lock_not_available, query_canceled and the connection_exception class.
pub(crate) fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "55P03" | "57014") || code.starts_with("08")
}

/// Class 23: integrity constraint violation
pub(crate) fn is_constraint_sqlstate(code: &str) -> bool {
    code.starts_with("23")
}

/// numeric_value_out_of_range, e.g. a BIGINT balance overflow
pub(crate) fn is_out_of_range_sqlstate(code: &str) -> bool {
    code == "22003"
}

impl LedgerError {
    /// Classify an error returned by COMMIT.
    ///
    /// A server-side error means the server rolled the transaction back
    /// (serialization failure, deferred constraint), so the usual
    /// classification holds. Anything else means the reply was lost and
    /// the commit may or may not have happened.
    pub(crate) fn from_commit(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(_) => LedgerError::from(e),
            other => LedgerError::CommitOutcomeUnknown(other),
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
                let constraint = db_err.constraint().map(str::to_owned);

                if is_transient_sqlstate(&code) {
                    LedgerError::Transient(e)
                } else if is_out_of_range_sqlstate(&code) {
                    LedgerError::OutOfRange(e)
                } else if is_constraint_sqlstate(&code) {
                    LedgerError::Constraint {
                        constraint: constraint.unwrap_or_else(|| code.clone()),
                        source: e,
                    }
                } else {
                    LedgerError::Database(e)
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => LedgerError::Transient(e),
            _ => LedgerError::Database(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LedgerError::SameAccount(1).code(), "SAME_ACCOUNT");
        assert_eq!(
            LedgerError::InsufficientFunds {
                account_id: 1,
                balance: 5,
                amount: 10
            }
            .code(),
            "INSUFFICIENT_FUNDS"
        );
        assert_eq!(LedgerError::Timeout(Duration::from_secs(1)).code(), "TIMEOUT");
    }

    #[test]
    fn test_rollback_failed_keeps_original() {
        let err = LedgerError::RollbackFailed {
            source: Box::new(LedgerError::AccountNotFound(7)),
            rollback: sqlx::Error::PoolClosed,
        };
        assert_eq!(err.code(), "ACCOUNT_NOT_FOUND");
        assert!(err.to_string().starts_with("Account not found: 7"));
        assert!(err.to_string().contains("rollback also failed"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("55P03"));
        assert!(is_transient_sqlstate("08006"));
        assert!(!is_transient_sqlstate("23503"));
        assert!(is_constraint_sqlstate("23503"));
        assert!(is_constraint_sqlstate("23514"));
        assert!(!is_constraint_sqlstate("42P01"));
    }

    #[test]
    fn test_non_database_sqlx_errors() {
        assert!(LedgerError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!LedgerError::from(sqlx::Error::RowNotFound).is_retryable());
        assert!(matches!(
            LedgerError::from(sqlx::Error::RowNotFound),
            LedgerError::Database(_)
        ));
    }

    #[test]
    fn test_out_of_range_classification() {
        assert!(is_out_of_range_sqlstate("22003"));
        assert!(!is_out_of_range_sqlstate("22001"));
        assert!(!is_constraint_sqlstate("22003"));
        assert!(!is_transient_sqlstate("22003"));

        let err = LedgerError::BalanceOverflow {
            account_id: 4,
            delta: 10,
        };
        assert_eq!(err.code(), "BALANCE_OVERFLOW");
        assert!(!err.is_retryable());
        assert!(!err.is_validation());
    }

    #[test]
    fn test_lost_commit_is_not_retryable() {
        let io = || std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");

        // Before commit a dropped connection rolls the transaction back
        assert!(LedgerError::from(sqlx::Error::Io(io())).is_retryable());

        let err = LedgerError::from_commit(sqlx::Error::Io(io()));
        assert!(matches!(err, LedgerError::CommitOutcomeUnknown(_)));
        assert_eq!(err.code(), "COMMIT_OUTCOME_UNKNOWN");
        assert!(!err.is_retryable());
        assert!(!LedgerError::from_commit(sqlx::Error::PoolClosed).is_retryable());
    }

    #[test]
    fn test_validation_errors() {
        assert!(LedgerError::InvalidAmount(0).is_validation());
        assert!(LedgerError::SameAccount(3).is_validation());
        assert!(!LedgerError::Cancelled.is_validation());
        assert!(!LedgerError::Cancelled.is_retryable());
    }
}
