//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - Balance rows (key: owner id)
//! - `entries` - Append-only history log (key: entry_id)
//! - `tokens` - Idempotency token index (key: token, value: entry_id)
//! - `indices` - Owner -> entries index (key: owner || '|' || entry_id)
//!
//! A mutation commits the balance row, the history entry, and both indices
//! in a single `WriteBatch`, so a reader never observes one without the
//! others. The `tokens` column family acts as a unique constraint: the
//! existence check and the insert are serialized under an internal guard,
//! and a second writer with the same token fails with `DuplicateToken`.

use crate::{
    error::{Error, Result},
    types::{Account, AccountStatus, EntryStatus, LedgerEntry, OwnerId},
    Config,
};
use parking_lot::Mutex;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_ENTRIES: &str = "entries";
const CF_TOKENS: &str = "tokens";
const CF_INDICES: &str = "indices";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    /// Serializes token existence-check + insert (poor man's unique constraint)
    token_guard: Mutex<()>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );

        // Universal compaction for write-heavy workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        // Column family descriptors
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_accounts()),
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_entries()),
            ColumnFamilyDescriptor::new(CF_TOKENS, Self::cf_options_tokens()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
        ];

        // Open database
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!("Opened RocksDB at {:?}", path);

        Ok(Self {
            db: Arc::new(db),
            token_guard: Mutex::new(()),
        })
    }

    // Column family options

    fn cf_options_accounts() -> Options {
        let mut opts = Options::default();
        // Balances are frequently read, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_entries() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_tokens() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Token lookups benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    // Account operations

    /// Get account by owner, if present
    pub fn get_account(&self, owner_id: &OwnerId) -> Result<Option<Account>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;

        match self.db.get_cf(cf, owner_id.as_str().as_bytes())? {
            Some(value) => {
                let account: Account = bincode::deserialize(&value)?;
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    /// Set account status (administrative, outside the mutation protocol)
    ///
    /// Rewrites the whole account row; the caller must hold the owner's
    /// row lock so the read-modify-write cannot race a mutation.
    pub fn set_account_status(&self, owner_id: &OwnerId, status: AccountStatus) -> Result<Account> {
        let mut account = self
            .get_account(owner_id)?
            .ok_or_else(|| Error::AccountNotFound(owner_id.to_string()))?;
        account.status = status;
        account.updated_at = chrono::Utc::now();

        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let value = bincode::serialize(&account)?;
        self.db.put_cf(cf, owner_id.as_str().as_bytes(), &value)?;

        Ok(account)
    }

    // Entry operations

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        let cf = self.cf_handle(CF_ENTRIES)?;

        let value = self
            .db
            .get_cf(cf, entry_id.as_bytes())?
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;

        let entry: LedgerEntry = bincode::deserialize(&value)?;
        Ok(entry)
    }

    /// Get all entries for an owner, oldest first (via index)
    pub fn entries_for_owner(&self, owner_id: &OwnerId) -> Result<Vec<LedgerEntry>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;

        let prefix = Self::index_prefix(owner_id);
        let iter = self.db.iterator_cf(
            cf_indices,
            IteratorMode::From(prefix.as_slice(), Direction::Forward),
        );

        let mut entries = Vec::new();
        for item in iter {
            let (key, _) = item?;

            if !key.starts_with(&prefix) {
                break;
            }

            // Entry id is the 16 bytes after the prefix
            if key.len() == prefix.len() + 16 {
                let entry_id_bytes: [u8; 16] = key[prefix.len()..]
                    .try_into()
                    .map_err(|_| Error::Storage("malformed index key".to_string()))?;
                let entry = self.get_entry(Uuid::from_bytes(entry_id_bytes))?;
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Look up the entry recorded under an idempotency token
    pub fn find_by_token(&self, token: &str) -> Result<Option<LedgerEntry>> {
        let cf = self.cf_handle(CF_TOKENS)?;

        match self.db.get_cf(cf, token.as_bytes())? {
            Some(value) => {
                let entry_id_bytes: [u8; 16] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage("malformed token index value".to_string()))?;
                let entry = self.get_entry(Uuid::from_bytes(entry_id_bytes))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Update entry status (the only permitted post-creation change)
    pub fn set_entry_status(&self, entry_id: Uuid, status: EntryStatus) -> Result<LedgerEntry> {
        let mut entry = self.get_entry(entry_id)?;
        entry.status = status;

        let cf = self.cf_handle(CF_ENTRIES)?;
        let value = bincode::serialize(&entry)?;
        self.db.put_cf(cf, entry_id.as_bytes(), &value)?;

        Ok(entry)
    }

    // Mutation commit (atomic)

    /// Commit one mutation: balance row, history entry, and indices
    ///
    /// Fails with `DuplicateToken` if the entry carries a token that is
    /// already recorded; in that case nothing is written.
    pub fn apply_mutation(&self, account: &Account, entry: &LedgerEntry) -> Result<()> {
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_entries = self.cf_handle(CF_ENTRIES)?;
        let cf_tokens = self.cf_handle(CF_TOKENS)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;

        let account_value = bincode::serialize(account)?;
        let entry_value = bincode::serialize(entry)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_accounts, account.owner_id.as_str().as_bytes(), &account_value);
        batch.put_cf(cf_entries, entry.entry_id.as_bytes(), &entry_value);

        let mut index_key = Self::index_prefix(&entry.owner_id);
        index_key.extend_from_slice(entry.entry_id.as_bytes());
        batch.put_cf(cf_indices, &index_key, &[] as &[u8]);

        match &entry.idempotency_token {
            Some(token) => {
                batch.put_cf(cf_tokens, token.as_bytes(), entry.entry_id.as_bytes());

                // Check-and-insert must be indivisible for the token index
                // to behave like a unique constraint.
                let _guard = self.token_guard.lock();
                if self.db.get_cf(cf_tokens, token.as_bytes())?.is_some() {
                    return Err(Error::DuplicateToken(token.clone()));
                }
                self.db.write(batch)?;
            }
            None => {
                self.db.write(batch)?;
            }
        }

        tracing::debug!(
            entry_id = %entry.entry_id,
            owner_id = %entry.owner_id,
            amount = %entry.amount,
            balance = %account.balance,
            "Mutation committed"
        );

        Ok(())
    }

    // Index key helpers

    fn index_prefix(owner_id: &OwnerId) -> Vec<u8> {
        let mut key = owner_id.as_str().as_bytes().to_vec();
        key.push(b'|'); // Separator
        key
    }

    // Statistics

    /// Get storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        let cf_entries = self.cf_handle(CF_ENTRIES)?;

        Ok(StorageStats {
            total_accounts: self.approximate_count(cf_accounts)?,
            total_entries: self.approximate_count(cf_entries)?,
        })
    }

    fn approximate_count(&self, cf: &ColumnFamily) -> Result<u64> {
        // RocksDB property for approximate count
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Number of account rows (approximate)
    pub total_accounts: u64,
    /// Number of history entries (approximate)
    pub total_entries: u64,
}
