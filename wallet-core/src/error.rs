//! Error types for the wallet ledger

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for wallet operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wallet errors
#[derive(Error, Debug)]
pub enum Error {
    /// Owner identifier is empty
    #[error("Owner id must not be empty")]
    InvalidOwner,

    /// Mutation amount is zero or negative
    #[error("Invalid amount: {0} (must be positive)")]
    InvalidAmount(Decimal),

    /// Account does not exist (debit and reads only; credit creates)
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Debit would take the balance below zero
    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Balance at the time of the check
        available: Decimal,
        /// Requested debit magnitude
        requested: Decimal,
    },

    /// Applying the amount would push the balance out of the
    /// representable decimal range
    #[error("Balance overflow applying {amount} to {balance}")]
    BalanceOverflow {
        /// Balance at the time of the check
        balance: Decimal,
        /// Signed amount being applied
        amount: Decimal,
    },

    /// Row lock could not be acquired within the configured wait
    #[error("Lock wait timed out for owner: {0}")]
    LockTimeout(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Idempotency token already used by a prior entry
    ///
    /// Internal to the mutation path: `credit`/`debit` resolve it to a
    /// replayed receipt and never return it to callers.
    #[error("Duplicate idempotency token: {0}")]
    DuplicateToken(String),

    /// History entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True if the caller may safely retry the same call
    ///
    /// Retryable failures abort before anything is committed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout(_) | Error::Storage(_) | Error::Io(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
