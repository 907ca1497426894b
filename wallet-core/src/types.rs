//! Core types for the wallet ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - Immutability of history entries after creation

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Owner identifier (user id, tenant principal, etc.)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create new owner ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the identifier is empty (rejected by the mutator)
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Account status
///
/// Informational only: the mutation path does not enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccountStatus {
    /// Account is active
    Active = 1,
    /// Account is administratively disabled
    Inactive = 2,
}

/// Balance row for one owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Owner this balance belongs to
    pub owner_id: OwnerId,

    /// Current balance (exact decimal, 2 decimal places)
    pub balance: Decimal,

    /// Account status
    pub status: AccountStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a fresh zero-balance account
    pub fn new(owner_id: OwnerId) -> Self {
        let now = Utc::now();
        Self {
            owner_id,
            balance: Decimal::ZERO,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

/// History entry status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryStatus {
    /// Applied, awaiting external confirmation
    Pending = 1,
    /// Confirmed
    #[default]
    Completed = 2,
    /// Failed at the origin (gateway side); balance already reflects the entry
    Failed = 3,
}

/// Immutable record of one applied credit or debit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7 for time-ordering)
    pub entry_id: Uuid,

    /// Owner whose balance this entry mutated
    pub owner_id: OwnerId,

    /// Signed amount: positive for credit, negative for debit
    pub amount: Decimal,

    /// Balance immediately after this entry was applied
    pub balance_after: Decimal,

    /// Caller-supplied deduplication token (unique across all entries)
    pub idempotency_token: Option<String>,

    /// Origin gateway name, if any
    pub gateway: Option<String>,

    /// Entry status
    pub status: EntryStatus,

    /// Opaque caller metadata, carried through uninterpreted
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// True if this entry recorded a credit
    pub fn is_credit(&self) -> bool {
        self.amount > Decimal::ZERO
    }
}

/// Result of a successful mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Entry that recorded the mutation
    pub entry_id: Uuid,

    /// Owner whose balance was (or had been) mutated
    pub owner_id: OwnerId,

    /// Balance after the mutation was applied
    pub balance: Decimal,

    /// True if an idempotency token matched a prior entry and nothing
    /// was modified; `balance` is then the prior `balance_after`
    pub replayed: bool,
}

/// Per-owner reporting summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerSummary {
    /// Owner being summarized
    pub owner_id: OwnerId,
    /// Sum of all credit amounts
    pub total_credited: Decimal,
    /// Sum of all debit magnitudes (positive number)
    pub total_debited: Decimal,
    /// Number of history entries
    pub entry_count: usize,
}
