use std::io;

/// Error taxonomy for the storage engine.
///
/// Sub-component errors ("already closed" from an appendable, watcher hub or
/// the tx pool) are surfaced uniformly through the engine-level variants so
/// callers match on one type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("illegal argument: {0}")]
    IllegalArgument(&'static str),

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("already closed")]
    AlreadyClosed,

    #[error("no entries provided")]
    NoEntriesProvided,

    #[error("null key")]
    NullKey,

    #[error("max key length exceeded")]
    MaxKeyLenExceeded,

    #[error("max value length exceeded")]
    MaxValueLenExceeded,

    #[error("max number of entries per tx exceeded")]
    MaxTxEntriesLimitExceeded,

    #[error("duplicated key")]
    DuplicatedKey,

    #[error("max concurrency limit exceeded")]
    MaxConcurrencyLimitExceeded,

    #[error("max active transactions limit exceeded")]
    MaxActiveTransactionsLimitExceeded,

    #[error("max waitees limit exceeded")]
    MaxWaiteesLimitExceeded,

    #[error("MVCC read-set limit exceeded")]
    MvccReadSetLimitExceeded,

    #[error("tx read conflict")]
    TxReadConflict,

    #[error("tx already committed")]
    TxAlreadyCommitted,

    #[error("write-only transaction")]
    WriteOnlyTx,

    #[error("read-only transaction")]
    ReadOnlyTx,

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid precondition: {0}")]
    InvalidPrecondition(&'static str),

    #[error("tx not found")]
    TxNotFound,

    #[error("key not found")]
    KeyNotFound,

    /// Specialisation of [`StoreError::KeyNotFound`]: the entry exists but its
    /// expiration timestamp has elapsed.
    #[error("expired entry")]
    ExpiredEntry,

    #[error("tx entry index out of range")]
    TxEntryIndexOutOfRange,

    #[error("offset out of range")]
    OffsetOutOfRange,

    #[error("buffer is full")]
    BufferFull,

    /// Short read. Also the signal that a value reference points at a
    /// truncated value log or was replicated without its value.
    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("data is corrupted: {0}")]
    CorruptedData(&'static str),

    #[error("tx data is corrupted: {0}")]
    CorruptedTxData(&'static str),

    #[error("commit log is corrupted: {0}")]
    CorruptedCLog(&'static str),

    #[error("hash tree is corrupted: {0}")]
    CorruptedAht(&'static str),

    #[error("internal inconsistency between linear and binary linking")]
    LinkingMismatch,

    #[error("source tx is newer than target tx")]
    SourceTxNewerThanTargetTx,

    #[error("replica diverged: {0}")]
    ReplicaDiverged(&'static str),

    #[error("cancelled")]
    Cancelled,

    #[error("unknown tx header version: {0}")]
    UnknownHeaderVersion(u16),

    #[error("tx metadata is unsupported with tx header version 0")]
    MetadataUnsupported,

    #[error("compaction is disabled")]
    CompactionDisabled,

    #[error("multiple errors: {0:?}")]
    Multi(Vec<StoreError>),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True for the whole not-found family, including the expired-entry
    /// specialisation.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::KeyNotFound | StoreError::TxNotFound | StoreError::ExpiredEntry
        )
    }

    /// Collapse a list of errors collected during shutdown into a single one.
    pub(crate) fn reduce(mut errs: Vec<StoreError>) -> Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(StoreError::Multi(errs)),
        }
    }
}
