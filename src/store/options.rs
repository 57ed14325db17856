use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Injectable time source (unix seconds).
pub type TimeFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Upper bound on key length, independent of configuration. Not lower than
/// the hash size.
pub const MAX_KEY_LEN: usize = 1024;

/// Upper bound on the number of value logs; vLog IDs must fit the top byte
/// of a value offset.
pub const MAX_PARALLEL_IO: usize = 127;

#[derive(Clone)]
pub struct Options {
    /// Require fsync of value logs, tx log and commit log before a tx is
    /// reported committed.
    pub synced: bool,
    /// Maximum lag between a precommit and the background sync wakeup.
    pub sync_frequency: Duration,
    /// Cap on precommitted-but-not-committed txs in synced mode.
    pub max_active_transactions: usize,
    /// Size of the tx-holder pool, i.e. concurrent writers.
    pub max_concurrency: usize,
    /// Number of value logs.
    pub max_io_concurrency: usize,
    /// Cap on concurrent blocked waiters across all watcher hubs.
    pub max_waitees: usize,
    // persisted on creation; immutable across reopens
    pub max_tx_entries: usize,
    pub max_key_len: usize,
    pub max_value_len: usize,
    pub file_size: u64,
    /// Tx header serialization version to write (0 or 1; 0 forbids tx
    /// metadata).
    pub write_tx_header_version: u16,
    pub write_buffer_size: usize,
    /// Value-log LRU cache capacity in entries; 0 disables the cache.
    pub vlog_cache_size: usize,
    pub tx_log_cache_size: usize,
    /// Replication gate: withhold commit until `allow_commit_upto` lifts the
    /// ceiling.
    pub use_external_commit_allowance: bool,
    pub compaction_disabled: bool,
    /// Cap on the MVCC read-set tracked by read-write transactions.
    pub mvcc_read_set_limit: usize,
    /// Injectable time source; defaults to the system clock.
    pub time_fn: Option<TimeFn>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            synced: true,
            sync_frequency: Duration::from_millis(20),
            max_active_transactions: 1000,
            max_concurrency: 30,
            max_io_concurrency: 1,
            max_waitees: 1000,
            max_tx_entries: 1024,
            max_key_len: 1024,
            max_value_len: 4096,
            file_size: 1 << 29,
            write_tx_header_version: 1,
            write_buffer_size: 1 << 22,
            vlog_cache_size: 0,
            tx_log_cache_size: 1000,
            use_external_commit_allowance: false,
            compaction_disabled: false,
            mvcc_read_set_limit: 100_000,
            time_fn: None,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("synced", &self.synced)
            .field("sync_frequency", &self.sync_frequency)
            .field("max_active_transactions", &self.max_active_transactions)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_io_concurrency", &self.max_io_concurrency)
            .field("max_waitees", &self.max_waitees)
            .field("max_tx_entries", &self.max_tx_entries)
            .field("max_key_len", &self.max_key_len)
            .field("max_value_len", &self.max_value_len)
            .field("file_size", &self.file_size)
            .field("write_tx_header_version", &self.write_tx_header_version)
            .field("vlog_cache_size", &self.vlog_cache_size)
            .field("tx_log_cache_size", &self.tx_log_cache_size)
            .field(
                "use_external_commit_allowance",
                &self.use_external_commit_allowance,
            )
            .field("compaction_disabled", &self.compaction_disabled)
            .field("mvcc_read_set_limit", &self.mvcc_read_set_limit)
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.max_io_concurrency == 0 || self.max_io_concurrency > MAX_PARALLEL_IO {
            return Err(StoreError::IllegalArgument("invalid max_io_concurrency"));
        }
        if self.max_key_len == 0 || self.max_key_len > MAX_KEY_LEN {
            return Err(StoreError::IllegalArgument("invalid max_key_len"));
        }
        if self.max_tx_entries == 0 {
            return Err(StoreError::IllegalArgument("invalid max_tx_entries"));
        }
        if self.max_value_len == 0 {
            return Err(StoreError::IllegalArgument("invalid max_value_len"));
        }
        if self.max_concurrency == 0 {
            return Err(StoreError::IllegalArgument("invalid max_concurrency"));
        }
        if self.max_active_transactions == 0 {
            return Err(StoreError::IllegalArgument(
                "invalid max_active_transactions",
            ));
        }
        if self.max_waitees == 0 {
            return Err(StoreError::IllegalArgument("invalid max_waitees"));
        }
        if self.file_size == 0 {
            return Err(StoreError::IllegalArgument("invalid file_size"));
        }
        if self.write_tx_header_version > crate::tx::MAX_TX_HEADER_VERSION {
            return Err(StoreError::IllegalArgument(
                "invalid write_tx_header_version",
            ));
        }
        if self.synced && self.sync_frequency.is_zero() {
            return Err(StoreError::IllegalArgument("invalid sync_frequency"));
        }
        Ok(())
    }

    pub(crate) fn resolved_time_fn(&self) -> TimeFn {
        self.time_fn.clone().unwrap_or_else(|| {
            Arc::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0)
            })
        })
    }
}
