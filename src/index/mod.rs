//! Key-index collaborator interface.
//!
//! The engine does not own an index; it publishes commit progress and reads
//! back through these traits. [`KeyIndex`] is the narrow read surface used
//! by precondition checks and commit callbacks; [`Indexer`] is the full
//! collaborator contract supplied at store construction. A process-local
//! in-memory implementation lives in [`mem`].

pub mod mem;

use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::tx::{KVMetadata, TxHeader};
use crate::watchers::Cancellation;
use crate::Digest;

/// Resolved reference to the latest (or a historical) value of a key.
#[derive(Debug, Clone)]
pub struct ValueRef {
    /// Transaction that set this version.
    pub tx: u64,
    /// Number of updates the key has seen up to this version.
    pub hc: u64,
    pub v_len: u32,
    pub v_off: u64,
    pub h_val: Digest,
    pub md: Option<KVMetadata>,
}

/// Read filters composed over index lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    IgnoreDeleted,
    IgnoreExpired,
}

impl Filter {
    pub fn check(&self, vref: &ValueRef, now: i64) -> Result<()> {
        match self {
            Filter::IgnoreDeleted => {
                if vref.md.as_ref().is_some_and(|md| md.deleted()) {
                    return Err(StoreError::KeyNotFound);
                }
            }
            Filter::IgnoreExpired => {
                if vref.md.as_ref().is_some_and(|md| md.expired_at(now)) {
                    return Err(StoreError::ExpiredEntry);
                }
            }
        }
        Ok(())
    }
}

pub const DEFAULT_FILTERS: [Filter; 2] = [Filter::IgnoreDeleted, Filter::IgnoreExpired];

/// Point-read capabilities over the indexed key space.
pub trait KeyIndex: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<ValueRef> {
        self.get_with_filters(key, &DEFAULT_FILTERS)
    }

    fn get_with_filters(&self, key: &[u8], filters: &[Filter]) -> Result<ValueRef>;

    /// Smallest key carrying `prefix` (strictly greater than `neq` when
    /// supplied, which callers use as a pagination seed).
    fn get_with_prefix(&self, prefix: &[u8], neq: Option<&[u8]>) -> Result<(Bytes, ValueRef)> {
        self.get_with_prefix_and_filters(prefix, neq, &DEFAULT_FILTERS)
    }

    fn get_with_prefix_and_filters(
        &self,
        prefix: &[u8],
        neq: Option<&[u8]>,
        filters: &[Filter],
    ) -> Result<(Bytes, ValueRef)>;
}

/// Full collaborator contract: the engine drives indexing progress through
/// this interface but never owns the indexer's storage.
pub trait Indexer: KeyIndex {
    /// Highest transaction the index has absorbed.
    fn indexed_upto(&self) -> u64;

    fn wait_for_indexing_upto(&self, tx_id: u64, cancel: Option<&Cancellation>) -> Result<()>;

    /// Transaction IDs that updated `key`, `offset` into the update sequence,
    /// plus the total update count.
    fn history(
        &self,
        key: &[u8],
        offset: u64,
        desc: bool,
        limit: usize,
    ) -> Result<(Vec<u64>, u64)>;

    fn compact(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Entry projection handed to indexers when a transaction commits.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub key: Bytes,
    pub md: Option<KVMetadata>,
    pub v_len: u32,
    pub v_off: u64,
    pub h_val: Digest,
}

/// Narrow engine view indexers consume: commit progress plus committed
/// transaction content. Implementations must not keep the engine alive.
pub trait TxSource: Send + Sync {
    fn committed_up_to(&self) -> u64;

    fn wait_committed(&self, tx_id: u64, cancel: Option<&Cancellation>) -> Result<()>;

    fn committed_entries(&self, tx_id: u64) -> Result<(TxHeader, Vec<IndexedEntry>)>;
}
