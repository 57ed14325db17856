//! Ongoing (not yet submitted) transactions and write preconditions.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::index::KeyIndex;
use crate::tx::{KVMetadata, TxMetadata};
use crate::Digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// One pending entry of an ongoing transaction.
#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub key: Bytes,
    pub metadata: Option<KVMetadata>,
    pub value: Bytes,
    /// Set when the value bytes were not transferred (replicated from a
    /// truncated source); `h_val` carries the original digest then.
    pub(crate) value_truncated: bool,
    pub(crate) h_val: Option<Digest>,
}

impl EntrySpec {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            metadata: None,
            value: value.into(),
            value_truncated: false,
            h_val: None,
        }
    }

    pub fn with_metadata(
        key: impl Into<Bytes>,
        metadata: Option<KVMetadata>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            metadata,
            value: value.into(),
            value_truncated: false,
            h_val: None,
        }
    }

    pub(crate) fn truncated(
        key: impl Into<Bytes>,
        metadata: Option<KVMetadata>,
        h_val: Digest,
    ) -> Self {
        Self {
            key: key.into(),
            metadata,
            value: Bytes::new(),
            value_truncated: true,
            h_val: Some(h_val),
        }
    }
}

/// Application-level write precondition, checked against the index right
/// before the transaction is sealed.
#[derive(Debug, Clone)]
pub enum Precondition {
    KeyMustExist { key: Bytes },
    KeyMustNotExist { key: Bytes },
    KeyNotModifiedAfterTx { key: Bytes, tx_id: u64 },
}

impl Precondition {
    pub(crate) fn validate(&self, max_key_len: usize) -> Result<()> {
        let key = match self {
            Precondition::KeyMustExist { key } => key,
            Precondition::KeyMustNotExist { key } => key,
            Precondition::KeyNotModifiedAfterTx { key, tx_id } => {
                if *tx_id == 0 {
                    return Err(StoreError::InvalidPrecondition("invalid transaction ID"));
                }
                key
            }
        };
        if key.is_empty() {
            return Err(StoreError::InvalidPrecondition("null key"));
        }
        if key.len() > max_key_len {
            return Err(StoreError::InvalidPrecondition("max key length exceeded"));
        }
        Ok(())
    }

    pub(crate) fn check(&self, index: &dyn KeyIndex) -> Result<bool> {
        match self {
            Precondition::KeyMustExist { key } => match index.get(key) {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            },
            Precondition::KeyMustNotExist { key } => match index.get(key) {
                Ok(_) => Ok(false),
                Err(e) if e.is_not_found() => Ok(true),
                Err(e) => Err(e),
            },
            Precondition::KeyNotModifiedAfterTx { key, tx_id } => {
                // Deletions and expired entries count as modifications.
                match index.get_with_filters(key, &[]) {
                    Ok(vref) => Ok(vref.tx <= *tx_id),
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Precondition::KeyMustExist { key } => {
                format!("key {:?} must exist", String::from_utf8_lossy(key))
            }
            Precondition::KeyMustNotExist { key } => {
                format!("key {:?} must not exist", String::from_utf8_lossy(key))
            }
            Precondition::KeyNotModifiedAfterTx { key, tx_id } => format!(
                "key {:?} must not be modified after tx {}",
                String::from_utf8_lossy(key),
                tx_id
            ),
        }
    }
}

/// A transaction under construction. Obtained from
/// [`Store::new_tx`](super::Store::new_tx) and consumed by
/// [`Store::commit`](super::Store::commit).
pub struct OngoingTx {
    pub(crate) mode: TxMode,
    pub(crate) entries: Vec<EntrySpec>,
    pub(crate) key_ref: HashMap<Bytes, usize>,
    pub(crate) preconditions: Vec<Precondition>,
    pub(crate) metadata: Option<TxMetadata>,
    pub(crate) unsafe_mvcc: bool,
    pub(crate) require_mvcc_on_following_txs: bool,
    /// `(key, tx observed)` pairs recorded by read-write lookups; tx 0 marks
    /// a key observed absent.
    pub(crate) read_set: Vec<(Bytes, u64)>,
    #[allow(dead_code)]
    pub(crate) snapshot_tx_id: u64,
}

impl OngoingTx {
    pub(crate) fn new(mode: TxMode, snapshot_tx_id: u64) -> Self {
        Self {
            mode,
            entries: Vec::new(),
            key_ref: HashMap::new(),
            preconditions: Vec::new(),
            metadata: None,
            unsafe_mvcc: false,
            require_mvcc_on_following_txs: false,
            read_set: Vec::new(),
            snapshot_tx_id,
        }
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.set_entry(EntrySpec::new(key, value))
    }

    pub fn set_with_metadata(
        &mut self,
        key: impl Into<Bytes>,
        metadata: KVMetadata,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.set_entry(EntrySpec::with_metadata(key, Some(metadata), value))
    }

    /// Logical deletion: a tombstone entry with deletion metadata and no
    /// value.
    pub fn delete(&mut self, key: impl Into<Bytes>) -> Result<()> {
        self.set_entry(EntrySpec::with_metadata(
            key,
            Some(KVMetadata::new().as_deleted(true)),
            Bytes::new(),
        ))
    }

    /// Setting an already-pending key replaces the pending entry.
    pub(crate) fn set_entry(&mut self, spec: EntrySpec) -> Result<()> {
        if self.mode == TxMode::ReadOnly {
            return Err(StoreError::ReadOnlyTx);
        }
        if spec.key.is_empty() {
            return Err(StoreError::NullKey);
        }
        match self.key_ref.get(&spec.key) {
            Some(&i) => self.entries[i] = spec,
            None => {
                self.key_ref.insert(spec.key.clone(), self.entries.len());
                self.entries.push(spec);
            }
        }
        Ok(())
    }

    /// Appends without key de-duplication; replication keeps the source
    /// entry list verbatim so the validator sees what was shipped.
    pub(crate) fn push_entry(&mut self, spec: EntrySpec) -> Result<()> {
        if self.mode == TxMode::ReadOnly {
            return Err(StoreError::ReadOnlyTx);
        }
        if spec.key.is_empty() {
            return Err(StoreError::NullKey);
        }
        self.entries.push(spec);
        Ok(())
    }

    pub fn with_metadata(&mut self, metadata: TxMetadata) -> &mut Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn add_precondition(&mut self, precondition: Precondition) {
        self.preconditions.push(precondition);
    }

    /// Evaluate preconditions against a possibly stale index; the mandatory
    /// MVCC watermark is still always observed.
    pub fn with_unsafe_mvcc(&mut self) -> &mut Self {
        self.unsafe_mvcc = true;
        self
    }

    /// Raise the engine's mandatory MVCC watermark to this tx once it
    /// precommits.
    pub fn require_mvcc_on_following_txs(&mut self) -> &mut Self {
        self.require_mvcc_on_following_txs = true;
        self
    }

    pub fn has_preconditions(&self) -> bool {
        !self.preconditions.is_empty()
    }

    pub(crate) fn record_read(&mut self, key: &[u8], at_tx: u64, limit: usize) -> Result<()> {
        if self.read_set.len() == limit {
            return Err(StoreError::MvccReadSetLimitExceeded);
        }
        self.read_set.push((Bytes::copy_from_slice(key), at_tx));
        Ok(())
    }

    pub(crate) fn check_preconditions(&self, index: &dyn KeyIndex) -> Result<()> {
        for p in &self.preconditions {
            if !p.check(index)? {
                return Err(StoreError::PreconditionFailed(p.describe()));
            }
        }
        Ok(())
    }

    pub(crate) fn check_read_set(&self, index: &dyn KeyIndex) -> Result<()> {
        for (key, at_tx) in &self.read_set {
            let current = match index.get_with_filters(key, &[]) {
                Ok(vref) => vref.tx,
                Err(e) if e.is_not_found() => 0,
                Err(e) => return Err(e),
            };
            if current != *at_tx {
                return Err(StoreError::TxReadConflict);
            }
        }
        Ok(())
    }

    /// Pending value for `key`, when this tx already wrote it.
    pub(crate) fn pending_entry(&self, key: &[u8]) -> Option<&EntrySpec> {
        self.key_ref.get(key).map(|&i| &self.entries[i])
    }
}
