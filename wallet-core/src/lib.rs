//! Wallet Core
//!
//! Balance ledger with concurrency-safe mutation and idempotent
//! transaction application.
//!
//! # Architecture
//!
//! - **Row Locking**: One exclusive lock per owner serializes the
//!   read-modify-write of that owner's balance
//! - **Atomic Commit**: Balance row and history entry land in one write
//!   batch; no observable intermediate state
//! - **Idempotency**: Caller-supplied tokens deduplicate replays; the
//!   token index behaves like a unique constraint
//!
//! # Invariants
//!
//! - Balance conservation: balance == Σ(entry amounts) per owner, always
//! - Append-only history: entries never modified after creation (status
//!   transitions excepted)
//! - No lost updates: concurrent mutations of one owner are serialized

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod storage;
pub mod types;
pub mod wallet;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use storage::{Storage, StorageStats};
pub use types::{
    Account, AccountStatus, EntryStatus, LedgerEntry, OwnerId, OwnerSummary, Receipt,
};
pub use wallet::{MutationRequest, Wallet};
