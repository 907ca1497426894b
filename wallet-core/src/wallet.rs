//! Balance mutator orchestration
//!
//! This module ties together storage, row locks, and metrics into the
//! high-level credit/debit API.
//!
//! Mutation protocol, per call: acquire the owner's row lock, check
//! idempotency, validate, write the new balance and the history entry in
//! one atomic commit, release the lock. Any failure before the commit
//! leaves no partial state.
//!
//! # Example
//!
//! ```no_run
//! use wallet_core::{Config, MutationRequest, OwnerId, Wallet};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> wallet_core::Result<()> {
//!     let wallet = Wallet::open(Config::default())?;
//!     let owner = OwnerId::new("user-1");
//!
//!     let receipt = wallet
//!         .credit(&owner, Decimal::new(10000, 2), MutationRequest::default())
//!         .await?;
//!     assert_eq!(receipt.balance, Decimal::new(10000, 2));
//!
//!     Ok(())
//! }
//! ```

use crate::{
    lock::RowLocks,
    metrics::Metrics,
    storage::{Storage, StorageStats},
    types::{
        Account, AccountStatus, EntryStatus, LedgerEntry, OwnerId, OwnerSummary, Receipt,
    },
    Config, Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Auxiliary fields describing the origin of a mutation
///
/// Everything here is carried into the history entry uninterpreted.
#[derive(Debug, Clone, Default)]
pub struct MutationRequest {
    /// Caller-supplied deduplication token; replays of the same token
    /// are no-ops returning the prior receipt
    pub idempotency_token: Option<String>,

    /// Origin gateway name, if any
    pub gateway: Option<String>,

    /// Initial entry status (defaults to `Completed`)
    pub status: EntryStatus,

    /// Opaque caller metadata
    pub metadata: HashMap<String, String>,
}

impl MutationRequest {
    /// Request carrying only an idempotency token
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            idempotency_token: Some(token.into()),
            ..Self::default()
        }
    }
}

/// Main wallet interface
pub struct Wallet {
    /// Storage backend
    storage: Arc<Storage>,

    /// Per-owner row locks
    locks: RowLocks,

    /// Metrics collector
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Wallet {
    /// Open wallet with configuration
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        Ok(Self {
            storage,
            locks: RowLocks::new(),
            metrics,
            config,
        })
    }

    /// Credit `amount` to an owner's balance
    ///
    /// Creates the account lazily if it does not exist. With an
    /// idempotency token, a replay returns the prior receipt and changes
    /// nothing.
    pub async fn credit(
        &self,
        owner_id: &OwnerId,
        amount: Decimal,
        request: MutationRequest,
    ) -> Result<Receipt> {
        let amount = self.validate(owner_id, amount)?;
        let start = Instant::now();

        let _row = self.locks.acquire(owner_id, self.config.lock_wait()).await?;

        if let Some(receipt) = self.check_replay(&request)? {
            return Ok(receipt);
        }

        let mut account = match self.storage.get_account(owner_id)? {
            Some(account) => account,
            // Lazy creation on first credit; the row is materialized by
            // the same commit as the entry
            None => Account::new(owner_id.clone()),
        };

        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(Error::BalanceOverflow {
                balance: account.balance,
                amount,
            })?;
        let receipt = self.commit(account, amount, request)?;

        self.metrics.record_credit();
        self.metrics
            .record_mutation_duration(start.elapsed().as_secs_f64());

        Ok(receipt)
    }

    /// Debit `amount` from an owner's balance
    ///
    /// Fails with `AccountNotFound` if the account does not exist (no
    /// implicit creation) and with `InsufficientFunds` if the balance
    /// cannot cover the amount. The recorded entry amount is negative.
    pub async fn debit(
        &self,
        owner_id: &OwnerId,
        amount: Decimal,
        request: MutationRequest,
    ) -> Result<Receipt> {
        let amount = self.validate(owner_id, amount)?;
        let start = Instant::now();

        let _row = self.locks.acquire(owner_id, self.config.lock_wait()).await?;

        let mut account = self
            .storage
            .get_account(owner_id)?
            .ok_or_else(|| Error::AccountNotFound(owner_id.to_string()))?;

        if let Some(receipt) = self.check_replay(&request)? {
            return Ok(receipt);
        }

        // Funds check and write happen under the same row lock, so two
        // concurrent debits cannot both observe sufficient funds.
        if account.balance < amount {
            self.metrics.record_rejection();
            return Err(Error::InsufficientFunds {
                available: account.balance,
                requested: amount,
            });
        }

        // Underflow is unreachable after the funds check
        account.balance = account
            .balance
            .checked_sub(amount)
            .ok_or(Error::BalanceOverflow {
                balance: account.balance,
                amount: -amount,
            })?;
        let receipt = self.commit(account, -amount, request)?;

        self.metrics.record_debit();
        self.metrics
            .record_mutation_duration(start.elapsed().as_secs_f64());

        Ok(receipt)
    }

    /// Current balance row for an owner
    ///
    /// Plain read, no lock. Never use the result as the basis for a
    /// subsequent mutation decision.
    pub fn balance(&self, owner_id: &OwnerId) -> Result<Account> {
        self.storage
            .get_account(owner_id)?
            .ok_or_else(|| Error::AccountNotFound(owner_id.to_string()))
    }

    /// Full history for an owner, oldest first
    pub fn entries(&self, owner_id: &OwnerId) -> Result<Vec<LedgerEntry>> {
        self.storage.entries_for_owner(owner_id)
    }

    /// Look up one history entry
    pub fn entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        self.storage.get_entry(entry_id)
    }

    /// Reporting helper: credited/debited totals for an owner
    pub fn owner_summary(&self, owner_id: &OwnerId) -> Result<OwnerSummary> {
        let entries = self.storage.entries_for_owner(owner_id)?;

        let mut total_credited = Decimal::ZERO;
        let mut total_debited = Decimal::ZERO;
        for entry in &entries {
            if entry.amount > Decimal::ZERO {
                total_credited += entry.amount;
            } else {
                total_debited -= entry.amount;
            }
        }

        Ok(OwnerSummary {
            owner_id: owner_id.clone(),
            total_credited,
            total_debited,
            entry_count: entries.len(),
        })
    }

    /// Check the balance invariant for one owner
    ///
    /// Verify that the account balance equals the sum of all history
    /// entry amounts. This is the critical invariant for financial
    /// correctness.
    pub fn check_balance_invariant(&self, owner_id: &OwnerId) -> Result<bool> {
        let balance = self
            .storage
            .get_account(owner_id)?
            .map(|a| a.balance)
            .unwrap_or(Decimal::ZERO);

        let sum: Decimal = self
            .storage
            .entries_for_owner(owner_id)?
            .iter()
            .map(|e| e.amount)
            .sum();

        Ok(balance == sum)
    }

    /// Mark an entry's status (administrative, separately authorized)
    pub fn set_entry_status(&self, entry_id: Uuid, status: EntryStatus) -> Result<LedgerEntry> {
        self.storage.set_entry_status(entry_id, status)
    }

    /// Mark an account's status (informational, not enforced on mutation)
    ///
    /// Takes the owner's row lock: the update rewrites the whole account
    /// row, so it must be serialized with mutations like any other
    /// read-modify-write of the balance.
    pub async fn set_account_status(
        &self,
        owner_id: &OwnerId,
        status: AccountStatus,
    ) -> Result<Account> {
        let _row = self.locks.acquire(owner_id, self.config.lock_wait()).await?;
        self.storage.set_account_status(owner_id, status)
    }

    /// Storage-level totals
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.stats()
    }

    /// Metrics collector (for scraping/export by the embedding service)
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Shutdown wallet
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.storage) {
            Ok(storage) => storage.close(),
            Err(_) => Ok(()), // Another handle still open; last one closes
        }
    }

    // Internal helpers

    /// Validate inputs and normalize the amount to 2 decimal places
    fn validate(&self, owner_id: &OwnerId, amount: Decimal) -> Result<Decimal> {
        if owner_id.is_empty() {
            return Err(Error::InvalidOwner);
        }

        let normalized = amount.round_dp(2);
        if normalized <= Decimal::ZERO {
            self.metrics.record_rejection();
            return Err(Error::InvalidAmount(amount));
        }

        Ok(normalized)
    }

    /// Idempotency check, performed while holding the row lock
    fn check_replay(&self, request: &MutationRequest) -> Result<Option<Receipt>> {
        let Some(token) = request.idempotency_token.as_deref() else {
            return Ok(None);
        };

        match self.storage.find_by_token(token)? {
            Some(prior) => {
                tracing::debug!(token, entry_id = %prior.entry_id, "Idempotent replay");
                self.metrics.record_replay();
                Ok(Some(Self::replay_receipt(prior)))
            }
            None => Ok(None),
        }
    }

    /// Build the entry and commit it atomically with the balance row
    ///
    /// `signed_amount` is positive for a credit, negative for a debit;
    /// `account.balance` must already reflect it.
    fn commit(
        &self,
        mut account: Account,
        signed_amount: Decimal,
        request: MutationRequest,
    ) -> Result<Receipt> {
        let now = Utc::now();
        account.updated_at = now;

        let entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            owner_id: account.owner_id.clone(),
            amount: signed_amount,
            balance_after: account.balance,
            idempotency_token: request.idempotency_token,
            gateway: request.gateway,
            status: request.status,
            metadata: request.metadata,
            created_at: now,
        };

        match self.storage.apply_mutation(&account, &entry) {
            Ok(()) => Ok(Receipt {
                entry_id: entry.entry_id,
                owner_id: account.owner_id,
                balance: account.balance,
                replayed: false,
            }),
            // The same token landed under a different owner's lock between
            // our pre-check and the commit; the mutation was not applied.
            Err(Error::DuplicateToken(token)) => {
                let prior = self.storage.find_by_token(&token)?.ok_or_else(|| {
                    Error::Storage(format!("token {} vanished after duplicate hit", token))
                })?;
                self.metrics.record_replay();
                Ok(Self::replay_receipt(prior))
            }
            Err(e) => Err(e),
        }
    }

    fn replay_receipt(prior: LedgerEntry) -> Receipt {
        Receipt {
            entry_id: prior.entry_id,
            owner_id: prior.owner_id,
            balance: prior.balance_after,
            replayed: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_test_wallet() -> (Wallet, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Wallet::open(config).unwrap(), temp_dir)
    }

    fn dec(cents: i64) -> Decimal {
        Decimal::new(cents, 2)
    }

    #[tokio::test]
    async fn test_credit_creates_account() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        let receipt = wallet
            .credit(&owner, dec(10000), MutationRequest::default())
            .await
            .unwrap();
        assert!(!receipt.replayed);
        assert_eq!(receipt.balance, dec(10000));

        let account = wallet.balance(&owner).unwrap();
        assert_eq!(account.balance, dec(10000));
        assert_eq!(account.status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn test_debit_requires_existing_account() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("nonexistent");

        let err = wallet
            .debit(&owner, dec(1000), MutationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccountNotFound(_)));

        // No rows were created
        assert!(wallet.balance(&owner).is_err());
        assert!(wallet.entries(&owner).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_state_untouched() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        wallet
            .credit(&owner, dec(3000), MutationRequest::default())
            .await
            .unwrap();

        let err = wallet
            .debit(&owner, dec(5000), MutationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        assert_eq!(wallet.balance(&owner).unwrap().balance, dec(3000));
        assert_eq!(wallet.entries(&owner).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        for amount in [Decimal::ZERO, dec(-100)] {
            let err = wallet
                .credit(&owner, amount, MutationRequest::default())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidAmount(_)));
        }

        let err = wallet
            .credit(&OwnerId::new(""), dec(100), MutationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOwner));
    }

    #[tokio::test]
    async fn test_idempotent_replay_single_entry() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        let first = wallet
            .credit(&owner, dec(10000), MutationRequest::with_token("tx-1"))
            .await
            .unwrap();
        assert!(!first.replayed);

        let second = wallet
            .credit(&owner, dec(10000), MutationRequest::with_token("tx-1"))
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(second.entry_id, first.entry_id);
        assert_eq!(second.balance, dec(10000));

        // Exactly one balance increase and one history row
        assert_eq!(wallet.balance(&owner).unwrap().balance, dec(10000));
        assert_eq!(wallet.entries(&owner).unwrap().len(), 1);
        assert_eq!(wallet.metrics().replays_total.get(), 1);
    }

    #[tokio::test]
    async fn test_debit_replay_does_not_double_apply() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        wallet
            .credit(&owner, dec(10000), MutationRequest::default())
            .await
            .unwrap();

        wallet
            .debit(&owner, dec(4000), MutationRequest::with_token("tx-d"))
            .await
            .unwrap();
        let replay = wallet
            .debit(&owner, dec(4000), MutationRequest::with_token("tx-d"))
            .await
            .unwrap();

        assert!(replay.replayed);
        assert_eq!(wallet.balance(&owner).unwrap().balance, dec(6000));
        assert_eq!(wallet.entries(&owner).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sign_convention_round_trip() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        wallet
            .credit(&owner, dec(7500), MutationRequest::default())
            .await
            .unwrap();
        let entries = wallet.entries(&owner).unwrap();
        assert_eq!(entries.last().unwrap().amount, dec(7500));

        wallet
            .debit(&owner, dec(2500), MutationRequest::default())
            .await
            .unwrap();
        let entries = wallet.entries(&owner).unwrap();
        assert_eq!(entries.last().unwrap().amount, dec(-2500));

        assert_eq!(wallet.balance(&owner).unwrap().balance, dec(5000));
        assert!(wallet.check_balance_invariant(&owner).unwrap());
    }

    #[tokio::test]
    async fn test_lock_timeout_aborts_cleanly() {
        let (mut wallet, _temp) = open_test_wallet();
        wallet.config.lock_wait_ms = 20;
        let owner = OwnerId::new("user-1");

        wallet
            .credit(&owner, dec(1000), MutationRequest::default())
            .await
            .unwrap();

        let _held = wallet
            .locks
            .acquire(&owner, std::time::Duration::from_secs(1))
            .await
            .unwrap();

        let err = wallet
            .credit(&owner, dec(1000), MutationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));
        assert!(err.is_retryable());

        // No partial state from the timed-out caller
        assert_eq!(wallet.balance(&owner).unwrap().balance, dec(1000));
        assert_eq!(wallet.entries(&owner).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_and_gateway_carried_through() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        let request = MutationRequest {
            idempotency_token: Some("tx-9".to_string()),
            gateway: Some("stripe".to_string()),
            status: EntryStatus::Pending,
            metadata: HashMap::from([("order".to_string(), "42".to_string())]),
        };

        let receipt = wallet.credit(&owner, dec(500), request).await.unwrap();

        let entry = wallet.entry(receipt.entry_id).unwrap();
        assert_eq!(entry.gateway.as_deref(), Some("stripe"));
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.metadata.get("order").map(String::as_str), Some("42"));

        // The separately-authorized status transition
        let updated = wallet
            .set_entry_status(receipt.entry_id, EntryStatus::Completed)
            .unwrap();
        assert_eq!(updated.status, EntryStatus::Completed);
    }

    #[tokio::test]
    async fn test_owner_summary() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        wallet
            .credit(&owner, dec(10000), MutationRequest::default())
            .await
            .unwrap();
        wallet
            .credit(&owner, dec(2500), MutationRequest::default())
            .await
            .unwrap();
        wallet
            .debit(&owner, dec(4000), MutationRequest::default())
            .await
            .unwrap();

        let summary = wallet.owner_summary(&owner).unwrap();
        assert_eq!(summary.total_credited, dec(12500));
        assert_eq!(summary.total_debited, dec(4000));
        assert_eq!(summary.entry_count, 3);
    }

    #[tokio::test]
    async fn test_inactive_account_still_mutable() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        wallet
            .credit(&owner, dec(1000), MutationRequest::default())
            .await
            .unwrap();
        wallet
            .set_account_status(&owner, AccountStatus::Inactive)
            .await
            .unwrap();

        // Status is informational; the mutation path does not enforce it
        wallet
            .credit(&owner, dec(500), MutationRequest::default())
            .await
            .unwrap();
        assert_eq!(wallet.balance(&owner).unwrap().balance, dec(1500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_status_update_does_not_clobber_concurrent_credits() {
        let (wallet, _temp) = open_test_wallet();
        let wallet = Arc::new(wallet);
        let owner = OwnerId::new("user-1");

        wallet
            .credit(&owner, dec(100), MutationRequest::default())
            .await
            .unwrap();

        // Interleave balance mutations with whole-row status rewrites;
        // both must serialize on the same row lock or a stale balance
        // gets written back over a committed credit.
        let mut handles = Vec::new();
        for i in 0..20 {
            let w = wallet.clone();
            let o = owner.clone();
            handles.push(tokio::spawn(async move {
                w.credit(&o, dec(100), MutationRequest::default())
                    .await
                    .map(|_| ())
            }));

            let w = wallet.clone();
            let o = owner.clone();
            let status = if i % 2 == 0 {
                AccountStatus::Inactive
            } else {
                AccountStatus::Active
            };
            handles.push(tokio::spawn(async move {
                w.set_account_status(&o, status).await.map(|_| ())
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(wallet.balance(&owner).unwrap().balance, dec(2100));
        assert_eq!(wallet.entries(&owner).unwrap().len(), 21);
        assert!(wallet.check_balance_invariant(&owner).unwrap());
    }

    #[tokio::test]
    async fn test_credit_overflow_returns_error() {
        let (wallet, _temp) = open_test_wallet();
        let owner = OwnerId::new("user-1");

        wallet
            .credit(&owner, Decimal::MAX, MutationRequest::default())
            .await
            .unwrap();

        let err = wallet
            .credit(&owner, Decimal::MAX, MutationRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BalanceOverflow { .. }));
        assert!(!err.is_retryable());

        // The failed credit left no partial state
        assert_eq!(wallet.balance(&owner).unwrap().balance, Decimal::MAX);
        assert_eq!(wallet.entries(&owner).unwrap().len(), 1);
        assert!(wallet.check_balance_invariant(&owner).unwrap());
    }
}
