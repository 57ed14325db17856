//! Engine core: transaction admission, durable append, two-phase commit,
//! dual cryptographic linking, proofs, replication, export and value-log
//! truncation.
//!
//! On-disk layout per store directory:
//!
//! ```text
//! <path>/tx/      transaction log (serialized txs back-to-back)
//! <path>/commit/  commit log (12-byte records: u64 txOffset | u32 txSize)
//! <path>/val_N/   value logs (raw entry values)
//! <path>/aht/     append-only hash tree leaves
//! ```
//!
//! Write path: values are appended to one pooled value log concurrently with
//! entry hashing; the serialized tx is appended to the tx log, linked into
//! the hash tree and recorded in the precommit ring buffer. In synced mode a
//! background syncer makes the tail durable (value logs -> tx log fsync)
//! before commit-log records are written and flushed; in unsynced mode
//! commit follows precommit immediately. External commit allowance gates the
//! commit point for replication quorums.

mod clog_buf;
mod ongoing;
mod options;
mod proof;

pub use ongoing::{EntrySpec, OngoingTx, Precondition, TxMode};
pub use options::{Options, TimeFn, MAX_KEY_LEN, MAX_PARALLEL_IO};
pub use proof::{
    verify_dual_proof, verify_linear_advance_proof, verify_linear_proof, DualProof,
    LinearAdvanceProof, LinearProof,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Condvar, Mutex, RwLock};
use rayon::prelude::*;

use crate::aht::{AHTree, AhtOptions};
use crate::appendable::{AppendableLog, LogOptions, Metadata};
use crate::error::{Result, StoreError};
use crate::index::mem::MemIndexer;
use crate::index::{Filter, IndexedEntry, Indexer, KeyIndex, TxSource, ValueRef, DEFAULT_FILTERS};
use crate::store::clog_buf::PrecommitBuffer;
use crate::tx::pool::{PooledTx, TxPool};
use crate::tx::{SliceReader, Tx, TxEntry, TxHeader};
use crate::watchers::{Cancellation, WatchersHub};
use crate::{empty_alh, sha256, Digest};

const CLOG_ENTRY_SIZE: u64 = 12;

const META_VERSION: &str = "VERSION";
const META_MAX_TX_ENTRIES: &str = "MAX_TX_ENTRIES";
const META_MAX_KEY_LEN: &str = "MAX_KEY_LEN";
const META_MAX_VALUE_LEN: &str = "MAX_VALUE_LEN";
const META_FILE_SIZE: &str = "FILE_SIZE";

const STORE_VERSION: u64 = 1;

fn encode_offset(offset: u64, vlog_id: u8) -> u64 {
    ((vlog_id as u64) << 56) | offset
}

fn decode_offset(v_off: u64) -> (u8, u64) {
    ((v_off >> 56) as u8, v_off & ((1u64 << 56) - 1))
}

/// Value logs checked in and out under a condition variable. IDs are
/// 1-based; 0 marks "no value stored".
struct VLogPool {
    vlogs: Vec<AppendableLog>,
    unlocked: Mutex<VecDeque<u8>>,
    cond: Condvar,
}

impl VLogPool {
    fn new(vlogs: Vec<AppendableLog>) -> Self {
        let unlocked = (1..=vlogs.len() as u8).collect();
        Self {
            vlogs,
            unlocked: Mutex::new(unlocked),
            cond: Condvar::new(),
        }
    }

    fn count(&self) -> usize {
        self.vlogs.len()
    }

    fn log(&self, id: u8) -> &AppendableLog {
        &self.vlogs[(id - 1) as usize]
    }

    /// Blocks until any value log is free; returns its ID.
    fn fetch_any(&self) -> u8 {
        let mut unlocked = self.unlocked.lock();
        loop {
            if let Some(id) = unlocked.pop_front() {
                return id;
            }
            self.cond.wait(&mut unlocked);
        }
    }

    /// Blocks until the named value log is free.
    fn fetch(&self, id: u8) {
        let mut unlocked = self.unlocked.lock();
        loop {
            if let Some(pos) = unlocked.iter().position(|&u| u == id) {
                unlocked.remove(pos);
                return;
            }
            self.cond.wait(&mut unlocked);
        }
    }

    fn release(&self, id: u8) {
        self.unlocked.lock().push_back(id);
        self.cond.notify_all();
    }
}

/// The five chain counters, guarded by the commit-state RW lock.
struct CommitState {
    committed_tx_id: u64,
    committed_alh: Digest,
    inmem_precommitted_tx_id: u64,
    inmem_precommitted_alh: Digest,
    precommitted_tx_log_size: u64,
    commit_allowed_up_to_tx_id: u64,
    use_external_commit_allowance: bool,
}

struct EngineState {
    closed: bool,
    mandatory_mvcc_up_to_tx_id: u64,
}

/// Cloneable handle over the storage engine. One engine per data directory;
/// lifecycle is `open -> operations -> close`.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,

    synced: bool,
    sync_frequency: Duration,
    max_active_transactions: usize,
    max_io_concurrency: usize,
    max_waitees: usize,
    max_tx_entries: usize,
    max_key_len: usize,
    max_value_len: usize,
    write_tx_header_version: u16,
    mvcc_read_set_limit: usize,
    compaction_disabled: bool,
    time_fn: TimeFn,

    vlog_pool: VLogPool,
    vlog_cache: Option<Mutex<LruCache<u64, Bytes>>>,
    tx_log: AppendableLog,
    tx_log_cache: Mutex<LruCache<u64, Arc<Vec<u8>>>>,
    clog: AppendableLog,
    clog_buf: PrecommitBuffer,
    aht: AHTree,

    commit_state: RwLock<CommitState>,
    state: Mutex<EngineState>,

    inmem_precommit_whub: Arc<WatchersHub>,
    durable_precommit_whub: Arc<WatchersHub>,
    commit_whub: Arc<WatchersHub>,

    tx_pool: TxPool,
    waitees: Mutex<usize>,
    val_buf: Mutex<Vec<u8>>,

    indexer: RwLock<Option<Arc<dyn Indexer>>>,
    close_cancel: Cancellation,
    syncer: Mutex<Option<JoinHandle<()>>>,
}

/// Factory for the index collaborator, invoked once during open with the
/// engine-side view it may consume.
pub type IndexerFactory = Box<dyn FnOnce(Arc<dyn TxSource>) -> Result<Arc<dyn Indexer>>>;

impl Store {
    /// Opens (or creates) a store with the built-in in-memory indexer.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Store> {
        let max_waitees = opts.max_waitees;
        let now = opts.resolved_time_fn();
        Self::open_with_indexer(
            path,
            opts,
            Box::new(move |source| {
                let indexer: Arc<dyn Indexer> = MemIndexer::start(source, now, max_waitees);
                Ok(indexer)
            }),
        )
    }

    /// Opens a store with a caller-supplied index collaborator.
    pub fn open_with_indexer(
        path: impl AsRef<Path>,
        opts: Options,
        indexer_factory: IndexerFactory,
    ) -> Result<Store> {
        opts.validate()?;

        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let metadata = Metadata::new()
            .put_int(META_VERSION, STORE_VERSION)
            .put_int(META_MAX_TX_ENTRIES, opts.max_tx_entries as u64)
            .put_int(META_MAX_KEY_LEN, opts.max_key_len as u64)
            .put_int(META_MAX_VALUE_LEN, opts.max_value_len as u64)
            .put_int(META_FILE_SIZE, opts.file_size)
            .to_bytes();

        let clog = AppendableLog::open(
            path.join("commit"),
            "txi",
            LogOptions {
                file_size: opts.file_size,
                metadata: metadata.clone(),
                write_buffer_size: opts.write_buffer_size,
                max_opened_files: 10,
            },
        )?;

        // Stored metadata wins over passed options across reopens.
        let stored = Metadata::from_bytes(&clog.metadata())?;
        let file_size = stored
            .get_int(META_FILE_SIZE)
            .ok_or(StoreError::CorruptedCLog("missing file size"))?;
        let max_tx_entries = stored
            .get_int(META_MAX_TX_ENTRIES)
            .ok_or(StoreError::CorruptedCLog("missing max tx entries"))?
            as usize;
        let max_key_len = stored
            .get_int(META_MAX_KEY_LEN)
            .ok_or(StoreError::CorruptedCLog("missing max key len"))?
            as usize;
        let max_value_len = (stored
            .get_int(META_MAX_VALUE_LEN)
            .ok_or(StoreError::CorruptedCLog("missing max value len"))?
            as usize)
            .max(opts.max_value_len);

        let log_opts = |md: Vec<u8>| LogOptions {
            file_size,
            metadata: md,
            write_buffer_size: opts.write_buffer_size,
            max_opened_files: 10,
        };

        let tx_log = AppendableLog::open(path.join("tx"), "tx", log_opts(metadata.clone()))?;

        let mut vlogs = Vec::with_capacity(opts.max_io_concurrency);
        for i in 0..opts.max_io_concurrency {
            vlogs.push(AppendableLog::open(
                path.join(format!("val_{i}")),
                "val",
                log_opts(metadata.clone()),
            )?);
        }

        // A trailing partial commit record is the residue of an incomplete
        // write; drop it.
        let mut clog_size = clog.size()?;
        if clog_size % CLOG_ENTRY_SIZE > 0 {
            clog_size -= clog_size % CLOG_ENTRY_SIZE;
            clog.set_offset(clog_size)?;
        }

        let committed_tx_id = clog_size / CLOG_ENTRY_SIZE;
        let mut committed_tx_log_size = 0u64;
        if clog_size > 0 {
            let mut rec = [0u8; CLOG_ENTRY_SIZE as usize];
            clog.read_exact_at(&mut rec, clog_size - CLOG_ENTRY_SIZE)
                .map_err(|_| StoreError::CorruptedCLog("could not read the last commit record"))?;
            let tx_off = u64::from_be_bytes(rec[..8].try_into().expect("sized"));
            let tx_size = u32::from_be_bytes(rec[8..].try_into().expect("sized"));
            committed_tx_log_size = tx_off + tx_size as u64;
            if tx_log.size()? < committed_tx_log_size {
                return Err(StoreError::CorruptedTxData("tx log is too small"));
            }
        }

        // one extra holder so the indexer never starves behind writers
        let tx_pool = TxPool::new(opts.max_concurrency + 1, max_tx_entries, max_key_len);

        let mut committed_alh = empty_alh();
        if committed_tx_id > 0 {
            let mut holder = tx_pool.alloc().expect("fresh pool");
            let mut rec = [0u8; CLOG_ENTRY_SIZE as usize];
            clog.read_exact_at(&mut rec, (committed_tx_id - 1) * CLOG_ENTRY_SIZE)?;
            let tx_off = u64::from_be_bytes(rec[..8].try_into().expect("sized"));
            let mut reader = tx_log.reader_at(tx_off);
            holder
                .read_from(&mut reader, false)
                .map_err(|_| StoreError::CorruptedTxData("could not read the last transaction"))?;
            committed_alh = holder.header.alh();
        }

        let clog_buf = PrecommitBuffer::new(opts.max_active_transactions);

        // Precommitted txs beyond the commit point are replayed from the tx
        // log; the scan stops at the first broken or partially written
        // record.
        let mut precommitted_tx_id = committed_tx_id;
        let mut precommitted_alh = committed_alh;
        let mut precommitted_tx_log_size = committed_tx_log_size;
        {
            let mut holder = tx_pool.alloc().expect("fresh pool");
            let mut reader = tx_log.reader_at(precommitted_tx_log_size);
            loop {
                let mark = reader.read_count();
                match holder.read_from(&mut reader, false) {
                    Ok(()) => {}
                    Err(StoreError::UnexpectedEof) => break,
                    Err(e) => {
                        tracing::warn!(
                            tx = precommitted_tx_id + 1,
                            error = %e,
                            "stopped reading precommitted transactions"
                        );
                        break;
                    }
                }
                if holder.header.id != precommitted_tx_id + 1
                    || holder.header.prev_alh != precommitted_alh
                {
                    tracing::warn!(
                        tx = precommitted_tx_id + 1,
                        "broken linear linking while reading precommitted transactions"
                    );
                    break;
                }
                precommitted_tx_id += 1;
                precommitted_alh = holder.header.alh();
                let tx_size = (reader.read_count() - mark) as u32;
                clog_buf.put(
                    precommitted_tx_id,
                    precommitted_alh,
                    precommitted_tx_log_size,
                    tx_size,
                )?;
                precommitted_tx_log_size += tx_size as u64;
            }
        }

        let aht = AHTree::open(
            path.join("aht"),
            AhtOptions {
                file_size,
                write_buffer_size: 1 << 16,
            },
        )?;

        let inner = Arc::new(StoreInner {
            path: path.clone(),
            synced: opts.synced,
            sync_frequency: opts.sync_frequency,
            max_active_transactions: opts.max_active_transactions,
            max_io_concurrency: opts.max_io_concurrency,
            max_waitees: opts.max_waitees,
            max_tx_entries,
            max_key_len,
            max_value_len,
            write_tx_header_version: opts.write_tx_header_version,
            mvcc_read_set_limit: opts.mvcc_read_set_limit,
            compaction_disabled: opts.compaction_disabled,
            time_fn: opts.resolved_time_fn(),
            vlog_pool: VLogPool::new(vlogs),
            vlog_cache: NonZeroUsize::new(opts.vlog_cache_size)
                .map(|cap| Mutex::new(LruCache::new(cap))),
            tx_log,
            tx_log_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(opts.tx_log_cache_size.max(1)).expect("non-zero"),
            )),
            clog,
            clog_buf,
            aht,
            commit_state: RwLock::new(CommitState {
                committed_tx_id,
                committed_alh,
                inmem_precommitted_tx_id: precommitted_tx_id,
                inmem_precommitted_alh: precommitted_alh,
                precommitted_tx_log_size,
                commit_allowed_up_to_tx_id: committed_tx_id,
                use_external_commit_allowance: opts.use_external_commit_allowance,
            }),
            state: Mutex::new(EngineState {
                closed: false,
                mandatory_mvcc_up_to_tx_id: 0,
            }),
            inmem_precommit_whub: Arc::new(WatchersHub::new(
                precommitted_tx_id,
                opts.max_active_transactions + 1,
            )),
            durable_precommit_whub: Arc::new(WatchersHub::new(
                precommitted_tx_id,
                opts.max_active_transactions + opts.max_waitees,
            )),
            commit_whub: Arc::new(WatchersHub::new(
                committed_tx_id,
                1 + opts.max_active_transactions + opts.max_waitees,
            )),
            tx_pool,
            waitees: Mutex::new(0),
            val_buf: Mutex::new(vec![0u8; max_value_len]),
            indexer: RwLock::new(None),
            close_cancel: Cancellation::new(),
            syncer: Mutex::new(None),
        });

        // Align the binary linking with the recovered linear state.
        if inner.aht.size() > precommitted_tx_id {
            inner.aht.reset_size(precommitted_tx_id)?;
        }
        if inner.aht.size() < precommitted_tx_id {
            inner.sync_binary_linking()?;
        } else {
            tracing::info!(path = %path.display(), "binary linking up to date");
        }

        let source: Arc<dyn TxSource> = Arc::new(WeakSource {
            inner: Arc::downgrade(&inner),
            commit_whub: inner.commit_whub.clone(),
            holder: Mutex::new(Tx::new(max_tx_entries, max_key_len)),
        });
        *inner.indexer.write() = Some(indexer_factory(source)?);

        if inner.synced {
            let weak = Arc::downgrade(&inner);
            let inmem_whub = inner.inmem_precommit_whub.clone();
            let cancel = inner.close_cancel.clone();
            let freq = inner.sync_frequency;
            let handle = std::thread::Builder::new()
                .name("ledgerdb-syncer".into())
                .spawn(move || syncer_loop(weak, inmem_whub, cancel, freq))
                .expect("spawn syncer thread");
            *inner.syncer.lock() = Some(handle);
        }

        tracing::info!(
            path = %path.display(),
            committed = committed_tx_id,
            precommitted = precommitted_tx_id,
            "store opened"
        );

        Ok(Store { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn synced(&self) -> bool {
        self.inner.synced
    }

    pub fn max_tx_entries(&self) -> usize {
        self.inner.max_tx_entries
    }

    pub fn max_key_len(&self) -> usize {
        self.inner.max_key_len
    }

    pub fn max_value_len(&self) -> usize {
        self.inner.max_value_len
    }

    pub fn max_io_concurrency(&self) -> usize {
        self.inner.max_io_concurrency
    }

    /// Number of committed transactions.
    pub fn tx_count(&self) -> u64 {
        self.last_committed_tx_id()
    }

    pub fn last_committed_tx_id(&self) -> u64 {
        self.inner.last_committed_tx_id()
    }

    pub fn last_precommitted_tx_id(&self) -> u64 {
        self.inner.last_precommitted_tx_id()
    }

    /// Committed transaction count plus its accumulative hash.
    pub fn committed_alh(&self) -> (u64, Digest) {
        let st = self.inner.commit_state.read();
        (st.committed_tx_id, st.committed_alh)
    }

    /// Durably precommitted transaction count plus its accumulative hash.
    pub fn precommitted_alh(&self) -> Result<(u64, Digest)> {
        self.inner.precommitted_alh()
    }

    pub fn new_tx(&self, mode: TxMode) -> Result<OngoingTx> {
        if self.is_closed() {
            return Err(StoreError::AlreadyClosed);
        }
        Ok(OngoingTx::new(mode, self.last_committed_tx_id()))
    }

    pub fn new_write_only_tx(&self) -> Result<OngoingTx> {
        self.new_tx(TxMode::WriteOnly)
    }

    /// Read-your-writes lookup inside a read-write transaction; observed
    /// versions join the MVCC read set.
    pub fn tx_get(&self, otx: &mut OngoingTx, key: &[u8]) -> Result<ValueRef> {
        if otx.mode() == TxMode::WriteOnly {
            return Err(StoreError::WriteOnlyTx);
        }
        if let Some(spec) = otx.pending_entry(key) {
            return Ok(ValueRef {
                tx: 0,
                hc: 0,
                v_len: spec.value.len() as u32,
                v_off: 0,
                h_val: sha256(&[&spec.value]),
                md: spec.metadata.clone(),
            });
        }
        let raw_tx = match self.get_with_filters(key, &[]) {
            Ok(vref) => vref.tx,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        otx.record_read(key, raw_tx, self.inner.mvcc_read_set_limit)?;
        self.get(key)
    }

    /// Precommits and waits for the commit point (durability included in
    /// synced mode), then optionally for indexing.
    pub fn commit(&self, otx: OngoingTx, wait_for_indexing: bool) -> Result<TxHeader> {
        let hdr = self.precommit(otx)?;
        self.inner.commit_whub.wait_for(hdr.id, None)?;
        if wait_for_indexing {
            self.inner.wait_for_indexing(hdr.id, None)?;
        }
        Ok(hdr)
    }

    /// Runs the precommit path only: the tx is serialized, linked and
    /// buffered but its commit record is not awaited. Callers pairing this
    /// with the external commit allowance complete the commit via
    /// [`Store::allow_commit_upto`].
    pub fn precommit(&self, mut otx: OngoingTx) -> Result<TxHeader> {
        self.inner.precommit_otx(&mut otx, None, false, None)
    }

    /// Builds and commits a transaction under the engine mutex: the callback
    /// observes the assigned tx ID and a stable index view.
    pub fn commit_with<F>(&self, callback: F, wait_for_indexing: bool) -> Result<TxHeader>
    where
        F: FnOnce(u64, &dyn KeyIndex) -> Result<(Vec<EntrySpec>, Vec<Precondition>)>,
    {
        let hdr = self.inner.precommit_with(callback)?;
        self.inner.commit_whub.wait_for(hdr.id, None)?;
        if wait_for_indexing {
            self.inner.wait_for_indexing(hdr.id, None)?;
        }
        Ok(hdr)
    }

    /// Blocks until the given tx is committed (or durably precommitted when
    /// `allow_precommitted` is set).
    pub fn wait_for_tx(
        &self,
        tx_id: u64,
        allow_precommitted: bool,
        cancel: Option<&Cancellation>,
    ) -> Result<()> {
        let _guard = self.inner.enter_waitee()?;
        if allow_precommitted {
            self.inner.durable_precommit_whub.wait_for(tx_id, cancel)
        } else {
            self.inner.commit_whub.wait_for(tx_id, cancel)
        }
    }

    pub fn wait_for_indexing_upto(&self, tx_id: u64, cancel: Option<&Cancellation>) -> Result<()> {
        self.inner.wait_for_indexing(tx_id, cancel)
    }

    /// Highest transaction absorbed by the index collaborator.
    pub fn indexed_upto(&self) -> Result<u64> {
        Ok(self.inner.indexer_handle()?.indexed_upto())
    }

    pub fn get(&self, key: &[u8]) -> Result<ValueRef> {
        self.get_with_filters(key, &DEFAULT_FILTERS)
    }

    pub fn get_with_filters(&self, key: &[u8], filters: &[Filter]) -> Result<ValueRef> {
        self.inner.indexer_handle()?.get_with_filters(key, filters)
    }

    pub fn get_with_prefix(&self, prefix: &[u8], neq: Option<&[u8]>) -> Result<(Bytes, ValueRef)> {
        self.inner.indexer_handle()?.get_with_prefix(prefix, neq)
    }

    pub fn history(
        &self,
        key: &[u8],
        offset: u64,
        desc: bool,
        limit: usize,
    ) -> Result<(Vec<u64>, u64)> {
        self.inner.indexer_handle()?.history(key, offset, desc, limit)
    }

    pub fn compact_index(&self) -> Result<()> {
        if self.inner.compaction_disabled {
            return Err(StoreError::CompactionDisabled);
        }
        self.inner.indexer_handle()?.compact()
    }

    /// Reads the value a [`ValueRef`] points at, verifying length and
    /// digest.
    pub fn resolve(&self, vref: &ValueRef) -> Result<Bytes> {
        if vref
            .md
            .as_ref()
            .is_some_and(|md| md.expired_at((self.inner.time_fn)()))
        {
            return Err(StoreError::ExpiredEntry);
        }
        let mut buf = vec![0u8; vref.v_len as usize];
        self.inner
            .read_value_into(&mut buf, vref.v_off, &vref.h_val, false)?;
        Ok(buf.into())
    }

    /// Reads the value of a transaction entry.
    pub fn read_value(&self, entry: &TxEntry) -> Result<Bytes> {
        if entry
            .metadata()
            .is_some_and(|md| md.expired_at((self.inner.time_fn)()))
        {
            return Err(StoreError::ExpiredEntry);
        }
        let mut buf = vec![0u8; entry.v_len() as usize];
        self.inner
            .read_value_into(&mut buf, entry.v_off(), &entry.h_val(), false)?;
        Ok(buf.into())
    }

    /// Reads a committed transaction into a fresh holder.
    pub fn read_tx(&self, tx_id: u64, skip_integrity: bool) -> Result<Tx> {
        let mut tx = Tx::new(self.inner.max_tx_entries, self.inner.max_key_len);
        self.inner
            .read_tx_into(tx_id, false, skip_integrity, &mut tx)?;
        Ok(tx)
    }

    pub fn read_tx_header(
        &self,
        tx_id: u64,
        allow_precommitted: bool,
        skip_integrity: bool,
    ) -> Result<TxHeader> {
        self.inner
            .read_tx_header(tx_id, allow_precommitted, skip_integrity)
    }

    /// Finds the entry for `key` within a committed transaction.
    pub fn read_tx_entry(&self, tx_id: u64, key: &[u8]) -> Result<(TxEntry, TxHeader)> {
        let mut holder = self.inner.fetch_alloc_tx()?;
        self.inner.read_tx_into(tx_id, false, false, &mut holder)?;
        let mut found: Option<TxEntry> = None;
        for e in holder.entries() {
            if e.key() == key {
                found = Some(e.clone());
                break;
            }
        }
        match found {
            Some(e) => Ok((e, holder.header.clone())),
            None => Err(StoreError::KeyNotFound),
        }
    }

    /// First committed tx whose timestamp is not below `ts`.
    pub fn first_tx_since(&self, ts: i64) -> Result<TxHeader> {
        let mut left = 1u64;
        let mut right = self.last_committed_tx_id();
        if right == 0 {
            return Err(StoreError::TxNotFound);
        }
        while left < right {
            let middle = left + (right - left) / 2;
            let header = self.read_tx_header(middle, false, false)?;
            if header.ts < ts {
                left = middle + 1;
            } else {
                right = middle;
            }
        }
        let header = self.read_tx_header(left, false, false)?;
        if header.ts < ts {
            return Err(StoreError::TxNotFound);
        }
        Ok(header)
    }

    /// Last committed tx whose timestamp is not above `ts`.
    pub fn last_tx_until(&self, ts: i64) -> Result<TxHeader> {
        let mut left = 1u64;
        let mut right = self.last_committed_tx_id();
        if right == 0 {
            return Err(StoreError::TxNotFound);
        }
        while left < right {
            let middle = left + (right - left + 1) / 2;
            let header = self.read_tx_header(middle, false, false)?;
            if header.ts > ts {
                right = middle - 1;
            } else {
                left = middle;
            }
        }
        let header = self.read_tx_header(left, false, false)?;
        if header.ts > ts {
            return Err(StoreError::TxNotFound);
        }
        Ok(header)
    }

    /// Serializes a transaction for replication (§ExportTx blob layout).
    pub fn export_tx(
        &self,
        tx_id: u64,
        allow_precommitted: bool,
        skip_integrity: bool,
    ) -> Result<Vec<u8>> {
        self.inner.export_tx(tx_id, allow_precommitted, skip_integrity)
    }

    /// Replays a transaction exported elsewhere, preserving its original
    /// identity (ID, timestamp, linking and witnessed root).
    pub fn replicate_tx(
        &self,
        exported: &[u8],
        skip_integrity: bool,
        wait_for_indexing: bool,
        cancel: Option<&Cancellation>,
    ) -> Result<TxHeader> {
        self.inner
            .replicate_tx(exported, skip_integrity, wait_for_indexing, cancel)
    }

    pub fn dual_proof(&self, source: &TxHeader, target: &TxHeader) -> Result<DualProof> {
        self.inner.dual_proof(source, target)
    }

    pub fn linear_proof(&self, source_tx_id: u64, target_tx_id: u64) -> Result<LinearProof> {
        self.inner.linear_proof(source_tx_id, target_tx_id)
    }

    /// Inclusion bridge for the linear segment `(source_tx_id, target_tx_id)`
    /// under the tree of size `target_bl_tx_id`; `None` when the segment is
    /// contiguous.
    pub fn linear_advance_proof(
        &self,
        source_tx_id: u64,
        target_tx_id: u64,
        target_bl_tx_id: u64,
    ) -> Result<Option<LinearAdvanceProof>> {
        self.inner
            .linear_advance_proof(source_tx_id, target_tx_id, target_bl_tx_id)
    }

    /// Current number of leaves in the append-only hash tree.
    pub fn tree_size(&self) -> u64 {
        self.inner.aht.size()
    }

    /// Lifts the external commit ceiling; allowances are monotone and capped
    /// at the precommitted tail.
    pub fn allow_commit_upto(&self, tx_id: u64) -> Result<()> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }
        let mut st = self.inner.commit_state.write();
        if !st.use_external_commit_allowance {
            return Err(StoreError::IllegalState(
                "external commit allowance is not enabled",
            ));
        }
        if tx_id <= st.commit_allowed_up_to_tx_id {
            // once allowed, a commit cannot be revoked
            return Ok(());
        }
        st.commit_allowed_up_to_tx_id = tx_id.min(st.inmem_precommitted_tx_id);
        if !self.inner.synced {
            self.inner.may_commit(&mut st, false)?;
        }
        Ok(())
    }

    pub fn set_external_commit_allowance(&self, enabled: bool) -> Result<()> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }
        let mut st = self.inner.commit_state.write();
        st.use_external_commit_allowance = enabled;
        if enabled {
            st.commit_allowed_up_to_tx_id = st.committed_tx_id;
        }
        Ok(())
    }

    /// Discards precommitted (never committed) transactions starting at
    /// `tx_id`; returns how many were dropped. Tx-log bytes are not
    /// truncated, so a reopen may pick them up unless discarded again.
    pub fn discard_precommitted_txs_since(&self, tx_id: u64) -> Result<usize> {
        self.inner.discard_precommitted_txs_since(tx_id)
    }

    /// On-demand durability barrier; flushes and fsyncs value logs, tx log
    /// and commit log, advancing the commit point.
    pub fn sync(&self) -> Result<()> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }
        self.inner.sync_internal()
    }

    /// Discards value-log space for values only referenced below `min_tx_id`.
    pub fn truncate_upto_tx(&self, min_tx_id: u64) -> Result<()> {
        self.inner.truncate_upto_tx(min_tx_id)
    }

    /// Closes the store: waiters unblock with `AlreadyClosed`, background
    /// threads stop, all logs are closed. Errors are aggregated.
    pub fn close(&self) -> Result<()> {
        self.inner.close_impl()
    }
}

impl StoreInner {
    fn last_committed_tx_id(&self) -> u64 {
        self.commit_state.read().committed_tx_id
    }

    fn last_precommitted_tx_id(&self) -> u64 {
        self.commit_state.read().inmem_precommitted_tx_id
    }

    fn precommitted_alh(&self) -> Result<(u64, Digest)> {
        let st = self.commit_state.read();
        let (durable, _) = self.durable_precommit_whub.status()?;
        if durable == st.committed_tx_id {
            return Ok((st.committed_tx_id, st.committed_alh));
        }
        if durable == st.inmem_precommitted_tx_id {
            return Ok((st.inmem_precommitted_tx_id, st.inmem_precommitted_alh));
        }
        let e = self
            .clog_buf
            .read_ahead((durable - st.committed_tx_id - 1) as usize)?;
        Ok((e.tx_id, e.alh))
    }

    fn indexer_handle(&self) -> Result<Arc<dyn Indexer>> {
        self.indexer.read().clone().ok_or(StoreError::AlreadyClosed)
    }

    fn enter_waitee(&self) -> Result<WaiteeGuard<'_>> {
        let mut count = self.waitees.lock();
        if *count == self.max_waitees {
            return Err(StoreError::MaxWaiteesLimitExceeded);
        }
        *count += 1;
        Ok(WaiteeGuard { counter: &self.waitees })
    }

    fn wait_for_indexing(&self, tx_id: u64, cancel: Option<&Cancellation>) -> Result<()> {
        let _guard = self.enter_waitee()?;
        self.indexer_handle()?.wait_for_indexing_upto(tx_id, cancel)
    }

    fn fetch_alloc_tx(&self) -> Result<PooledTx> {
        self.tx_pool
            .alloc()
            .ok_or(StoreError::MaxConcurrencyLimitExceeded)
    }

    fn validate_entries(&self, entries: &[EntrySpec]) -> Result<()> {
        if entries.len() > self.max_tx_entries {
            return Err(StoreError::MaxTxEntriesLimitExceeded);
        }
        let mut keys: HashSet<&[u8]> = HashSet::with_capacity(entries.len());
        for spec in entries {
            if spec.key.is_empty() {
                return Err(StoreError::NullKey);
            }
            if spec.key.len() > self.max_key_len {
                return Err(StoreError::MaxKeyLenExceeded);
            }
            if spec.value.len() > self.max_value_len {
                return Err(StoreError::MaxValueLenExceeded);
            }
            if !keys.insert(&spec.key) {
                return Err(StoreError::DuplicatedKey);
            }
        }
        Ok(())
    }

    fn validate_preconditions(&self, preconditions: &[Precondition]) -> Result<()> {
        if preconditions.len() > self.max_tx_entries {
            return Err(StoreError::InvalidPrecondition("too many preconditions"));
        }
        for p in preconditions {
            p.validate(self.max_key_len)?;
        }
        Ok(())
    }

    /// Appends entry values to one pooled value log, returning encoded
    /// offsets (0 for empty or withheld values).
    fn append_values(&self, entries: &[EntrySpec]) -> Result<Vec<u64>> {
        let mut offsets = vec![0u64; entries.len()];
        let vlog_id = self.vlog_pool.fetch_any();
        let res = (|| -> Result<()> {
            for (i, spec) in entries.iter().enumerate() {
                if spec.value.is_empty() {
                    continue;
                }
                let off = self.vlog_pool.log(vlog_id).append(&spec.value)?;
                offsets[i] = encode_offset(off, vlog_id);
                if let Some(cache) = &self.vlog_cache {
                    cache.lock().put(offsets[i], spec.value.clone());
                }
            }
            Ok(())
        })();
        self.vlog_pool.release(vlog_id);
        res.map(|_| offsets)
    }

    /// Fills the holder from the ongoing tx and builds its hash tree, while
    /// values stream to a value log on a separate thread.
    fn fill_tx(&self, tx: &mut Tx, otx: &OngoingTx, version: u16) -> Result<Vec<u64>> {
        if version == 0 && otx.metadata.as_ref().is_some_and(|m| !m.is_empty()) {
            return Err(StoreError::MetadataUnsupported);
        }
        if version == 0 && otx.entries.len() > u16::MAX as usize {
            return Err(StoreError::MaxTxEntriesLimitExceeded);
        }
        let (build_res, append_res) = std::thread::scope(|s| {
            let appender = s.spawn(|| self.append_values(&otx.entries));
            let build_res = (|| -> Result<()> {
                tx.header.version = version;
                tx.header.metadata = otx.metadata.clone();
                tx.header.nentries = otx.entries.len() as u32;
                for (i, spec) in otx.entries.iter().enumerate() {
                    let e = &mut tx.entries_mut()[i];
                    e.set_key(&spec.key);
                    e.set_metadata(spec.metadata.clone());
                    e.set_v_len(spec.value.len() as u32);
                    let h_val = if spec.value_truncated {
                        spec.h_val.ok_or(StoreError::IllegalArgument(
                            "truncated entry without value digest",
                        ))?
                    } else {
                        sha256(&[&spec.value])
                    };
                    e.set_h_val(h_val);
                    e.set_v_off(0);
                }
                tx.build_hash_tree()
            })();
            let append_res = appender
                .join()
                .unwrap_or_else(|_| Err(StoreError::IllegalState("value append panicked")));
            (build_res, append_res)
        });
        build_res?;
        append_res
    }

    fn precommit_otx(
        &self,
        otx: &mut OngoingTx,
        expected: Option<&TxHeader>,
        skip_integrity: bool,
        cancel: Option<&Cancellation>,
    ) -> Result<TxHeader> {
        if let Some(hdr) = expected {
            if hdr.nentries as usize != otx.entries.len() || hdr.metadata != otx.metadata {
                return Err(StoreError::IllegalArgument(
                    "transaction does not validate against header",
                ));
            }
        }
        if otx.entries.is_empty() && otx.metadata.as_ref().map_or(true, |m| m.is_empty()) {
            return Err(StoreError::NoEntriesProvided);
        }
        self.validate_entries(&otx.entries)?;
        self.validate_preconditions(&otx.preconditions)?;

        let version = expected
            .map(|h| h.version)
            .unwrap_or(self.write_tx_header_version);

        let mut holder = self.fetch_alloc_tx()?;
        let offsets = self.fill_tx(&mut holder, otx, version)?;

        if let Some(hdr) = expected {
            if !skip_integrity && holder.header.eh != hdr.eh {
                return Err(StoreError::IllegalArgument("entries digest differs"));
            }
            let last_precommitted = self.last_precommitted_tx_id();
            if last_precommitted >= hdr.id {
                return Err(StoreError::TxAlreadyCommitted);
            }
            if hdr.id > last_precommitted + self.max_active_transactions as u64 {
                return Err(StoreError::MaxActiveTransactionsLimitExceeded);
            }
            // replicated txs must apply in their original order
            self.inmem_precommit_whub.wait_for(hdr.id - 1, cancel)?;
            let bl_root = if hdr.bl_tx_id > 0 {
                self.aht.root_at(hdr.bl_tx_id)?
            } else {
                [0u8; 32]
            };
            if bl_root != hdr.bl_root {
                return Err(StoreError::ReplicaDiverged("witnessed tree root differs"));
            }
        }

        let mut state = self.state.lock();
        self.precommit_locked(&mut state, otx, &mut holder, offsets, expected, cancel)
    }

    fn precommit_locked(
        &self,
        state: &mut EngineState,
        otx: &mut OngoingTx,
        tx: &mut Tx,
        offsets: Vec<u64>,
        expected: Option<&TxHeader>,
        cancel: Option<&Cancellation>,
    ) -> Result<TxHeader> {
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }

        let (curr_tx_id, curr_alh) = {
            let st = self.commit_state.read();
            (st.inmem_precommitted_tx_id, st.inmem_precommitted_alh)
        };

        if let Some(hdr) = expected {
            // rechecked under the engine mutex against simultaneous writers
            if curr_tx_id > hdr.id - 1 {
                return Err(StoreError::TxAlreadyCommitted);
            }
            if curr_tx_id < hdr.id - 1 {
                return Err(StoreError::IllegalState("tx applied in wrong order"));
            }
            if curr_alh != hdr.prev_alh {
                return Err(StoreError::ReplicaDiverged(
                    "previous accumulative hash differs",
                ));
            }
        }

        if otx.has_preconditions() || !otx.read_set.is_empty() {
            // evaluation must observe an up-to-date tree, or at least the
            // mandatory MVCC watermark under unsafe MVCC
            let upto = if otx.unsafe_mvcc && state.mandatory_mvcc_up_to_tx_id > 0 {
                state.mandatory_mvcc_up_to_tx_id
            } else {
                curr_tx_id
            };
            self.wait_for_indexing(upto, cancel)?;
            let indexer = self.indexer_handle()?;
            let key_index: &dyn KeyIndex = &*indexer;
            otx.check_preconditions(key_index)?;
            otx.check_read_set(key_index)?;
        }

        for (i, off) in offsets.iter().enumerate() {
            tx.entries_mut()[i].set_v_off(*off);
        }

        let (ts, bl_tx_id) = match expected {
            Some(hdr) => (hdr.ts, hdr.bl_tx_id),
            None => ((self.time_fn)(), self.aht.size()),
        };

        self.perform_precommit(tx, ts, bl_tx_id)?;

        if otx.require_mvcc_on_following_txs {
            state.mandatory_mvcc_up_to_tx_id = tx.header.id;
        }

        Ok(tx.header.clone())
    }

    /// Seals the tx under the commit-state write lock: assigns identity,
    /// serializes into the tx log, links into the hash tree and buffers the
    /// commit record.
    fn perform_precommit(&self, tx: &mut Tx, ts: i64, bl_tx_id: u64) -> Result<()> {
        let mut st = self.commit_state.write();

        if self.synced
            && st.committed_tx_id + self.max_active_transactions as u64
                <= st.inmem_precommitted_tx_id
        {
            return Err(StoreError::MaxActiveTransactionsLimitExceeded);
        }

        // overwrites partially written and uncommitted data
        self.tx_log.set_offset(st.precommitted_tx_log_size)?;

        tx.header.id = st.inmem_precommitted_tx_id + 1;
        tx.header.ts = ts;
        tx.header.bl_tx_id = bl_tx_id;
        tx.header.bl_root = if bl_tx_id > 0 {
            self.aht.root_at(bl_tx_id)?
        } else {
            [0u8; 32]
        };
        if tx.header.id <= tx.header.bl_tx_id {
            return Err(StoreError::LinkingMismatch);
        }
        tx.header.prev_alh = st.inmem_precommitted_alh;

        let mut buf = Vec::with_capacity(4096);
        tx.serialize_into(&mut buf);
        let alh = tx.header.alh();
        let tx_size = buf.len() as u32;

        let tx_off = self.tx_log.append(&buf)?;
        self.tx_log_cache.lock().put(tx.header.id, Arc::new(buf));

        self.aht.reset_size(st.inmem_precommitted_tx_id)?;
        self.aht.append(alh)?;

        st.inmem_precommitted_tx_id += 1;
        st.inmem_precommitted_alh = alh;
        st.precommitted_tx_log_size += tx_size as u64;

        self.inmem_precommit_whub
            .done_upto(st.inmem_precommitted_tx_id)?;

        self.clog_buf
            .put(st.inmem_precommitted_tx_id, alh, tx_off, tx_size)?;

        if !self.synced {
            self.durable_precommit_whub
                .done_upto(st.inmem_precommitted_tx_id)?;
            self.may_commit(&mut st, false)?;
        }

        Ok(())
    }

    fn precommit_with<F>(&self, callback: F) -> Result<TxHeader>
    where
        F: FnOnce(u64, &dyn KeyIndex) -> Result<(Vec<EntrySpec>, Vec<Precondition>)>,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }

        let next_tx_id = self.last_precommitted_tx_id() + 1;
        let indexer = self.indexer_handle()?;
        let key_index: &dyn KeyIndex = &*indexer;
        let (entries, preconditions) = callback(next_tx_id, key_index)?;

        let mut otx = OngoingTx::new(TxMode::WriteOnly, self.last_committed_tx_id());
        otx.entries = entries;
        otx.preconditions = preconditions;

        if otx.entries.is_empty() {
            return Err(StoreError::NoEntriesProvided);
        }
        self.validate_entries(&otx.entries)?;
        self.validate_preconditions(&otx.preconditions)?;

        let mut holder = self.fetch_alloc_tx()?;
        let offsets = self.fill_tx(&mut holder, &otx, self.write_tx_header_version)?;

        self.precommit_locked(&mut state, &mut otx, &mut holder, offsets, None, None)
    }

    /// Writes commit-log records for every allowed precommitted tx and
    /// advances the commit point. Requires the commit-state write lock.
    fn may_commit(&self, st: &mut CommitState, durable: bool) -> Result<()> {
        let allowed = if st.use_external_commit_allowance {
            st.commit_allowed_up_to_tx_id
        } else {
            st.inmem_precommitted_tx_id
        };
        let count = allowed.saturating_sub(st.committed_tx_id) as usize;
        if count == 0 {
            return Ok(());
        }

        // overwrites any partially written commit record
        self.clog.set_offset(st.committed_tx_id * CLOG_ENTRY_SIZE)?;

        let mut commit_up_to = None;
        for i in 0..count {
            let e = self.clog_buf.read_ahead(i)?;
            let mut rec = [0u8; CLOG_ENTRY_SIZE as usize];
            rec[..8].copy_from_slice(&e.tx_off.to_be_bytes());
            rec[8..].copy_from_slice(&e.tx_size.to_be_bytes());
            self.clog.append(&rec)?;
            commit_up_to = Some(e);
        }
        let last = commit_up_to.expect("count > 0");
        if last.tx_id != allowed {
            // safety fuse; this should never happen
            return Err(StoreError::IllegalState("commit point mismatch"));
        }

        self.clog.flush()?;
        if durable {
            self.clog.sync()?;
        }
        self.clog_buf.advance_reader(count)?;

        st.committed_tx_id = last.tx_id;
        st.committed_alh = last.alh;

        self.commit_whub.done_upto(last.tx_id)?;
        Ok(())
    }

    /// Durability barrier: fsync every value log, then the tx log, then
    /// write + fsync the allowed commit records.
    fn sync_internal(&self) -> Result<()> {
        let mut st = self.commit_state.write();
        if st.inmem_precommitted_tx_id == st.committed_tx_id {
            // everything already synced
            return Ok(());
        }

        let ids: Vec<u8> = (1..=self.vlog_pool.count() as u8).collect();
        let errs: Vec<StoreError> = ids
            .par_iter()
            .filter_map(|&id| {
                self.vlog_pool.fetch(id);
                let res = self
                    .vlog_pool
                    .log(id)
                    .flush()
                    .and_then(|_| self.vlog_pool.log(id).sync());
                self.vlog_pool.release(id);
                res.err()
            })
            .collect();
        if let Some(e) = errs.into_iter().next() {
            return Err(e);
        }

        self.tx_log.flush()?;
        self.tx_log.sync()?;
        // tree leaves are only flushed; a lost tail is replayed from the tx
        // log on reopen
        self.aht.flush()?;

        self.durable_precommit_whub
            .done_upto(st.inmem_precommitted_tx_id)?;

        self.may_commit(&mut st, true)
    }

    fn sync_binary_linking(&self) -> Result<()> {
        tracing::info!(path = %self.path.display(), "syncing binary linking");
        let mut holder = self.fetch_alloc_tx()?;
        let upto = self.last_precommitted_tx_id();
        for tx_id in self.aht.size() + 1..=upto {
            self.read_tx_into(tx_id, true, false, &mut holder)?;
            self.aht.append(holder.header.alh())?;
            if tx_id % 1000 == 0 {
                tracing::info!(tx = tx_id, "binary linking in progress");
            }
        }
        tracing::info!(path = %self.path.display(), "binary linking up to date");
        Ok(())
    }

    fn tx_offset_and_size(&self, tx_id: u64) -> Result<(u64, u32)> {
        if tx_id == 0 {
            return Err(StoreError::IllegalArgument("invalid tx id"));
        }
        let mut rec = [0u8; CLOG_ENTRY_SIZE as usize];
        match self.clog.read_exact_at(&mut rec, (tx_id - 1) * CLOG_ENTRY_SIZE) {
            Ok(()) => {}
            // a partially readable commit record will be overwritten by the
            // next commit
            Err(StoreError::UnexpectedEof) => return Err(StoreError::TxNotFound),
            Err(e) => return Err(e),
        }
        Ok((
            u64::from_be_bytes(rec[..8].try_into().expect("sized")),
            u32::from_be_bytes(rec[8..].try_into().expect("sized")),
        ))
    }

    fn tx_bytes(&self, tx_id: u64, allow_precommitted: bool) -> Result<Arc<Vec<u8>>> {
        let (tx_off, tx_size) = {
            let st = self.commit_state.read();
            if tx_id == 0
                || tx_id > st.inmem_precommitted_tx_id
                || (!allow_precommitted && tx_id > st.committed_tx_id)
            {
                return Err(StoreError::TxNotFound);
            }
            if tx_id <= st.committed_tx_id {
                self.tx_offset_and_size(tx_id)?
            } else {
                let e = self
                    .clog_buf
                    .read_ahead((tx_id - st.committed_tx_id - 1) as usize)?;
                (e.tx_off, e.tx_size)
            }
        };

        if let Some(bs) = self.tx_log_cache.lock().get(&tx_id) {
            return Ok(bs.clone());
        }

        let mut bs = vec![0u8; tx_size as usize];
        self.tx_log
            .read_exact_at(&mut bs, tx_off)
            .map_err(|e| match e {
                StoreError::UnexpectedEof => {
                    StoreError::CorruptedTxData("unexpected EOF while reading tx")
                }
                other => other,
            })?;
        let bs = Arc::new(bs);
        self.tx_log_cache.lock().put(tx_id, bs.clone());
        Ok(bs)
    }

    fn read_tx_into(
        &self,
        tx_id: u64,
        allow_precommitted: bool,
        skip_integrity: bool,
        tx: &mut Tx,
    ) -> Result<()> {
        let bs = self.tx_bytes(tx_id, allow_precommitted)?;
        let mut reader = SliceReader::new(&bs);
        tx.read_from(&mut reader, skip_integrity).map_err(|e| match e {
            StoreError::UnexpectedEof => {
                StoreError::CorruptedTxData("unexpected EOF while reading tx")
            }
            other => other,
        })
    }

    fn read_tx_header(
        &self,
        tx_id: u64,
        allow_precommitted: bool,
        skip_integrity: bool,
    ) -> Result<TxHeader> {
        let mut holder = self.fetch_alloc_tx()?;
        self.read_tx_into(tx_id, allow_precommitted, skip_integrity, &mut holder)?;
        Ok(holder.header.clone())
    }

    /// Entry at `index` of a transaction; used by value-log truncation.
    fn tx_entry_at(&self, tx_id: u64, index: usize) -> Result<TxEntry> {
        let mut holder = self.fetch_alloc_tx()?;
        self.read_tx_into(tx_id, false, false, &mut holder)?;
        holder
            .entries()
            .get(index)
            .cloned()
            .ok_or(StoreError::TxEntryIndexOutOfRange)
    }

    /// Fills `buf` with the value at `v_off`. A zero vLog ID with a
    /// non-empty expectation signals a truncated or withheld value.
    fn read_value_into(
        &self,
        buf: &mut [u8],
        v_off: u64,
        h_val: &Digest,
        skip_integrity: bool,
    ) -> Result<usize> {
        let (vlog_id, offset) = decode_offset(v_off);

        if vlog_id == 0 && !buf.is_empty() {
            return Err(StoreError::UnexpectedEof);
        }

        let mut n = 0usize;
        if vlog_id > 0 {
            let mut cached = false;
            if let Some(cache) = &self.vlog_cache {
                if let Some(val) = cache.lock().get(&v_off) {
                    if val.len() == buf.len() {
                        buf.copy_from_slice(val);
                        n = val.len();
                        cached = true;
                    }
                }
            }
            if !cached {
                self.vlog_pool.fetch(vlog_id);
                let res = self.vlog_pool.log(vlog_id).read_exact_at(buf, offset);
                self.vlog_pool.release(vlog_id);
                res?;
                n = buf.len();
                if let Some(cache) = &self.vlog_cache {
                    cache.lock().put(v_off, Bytes::copy_from_slice(buf));
                }
            }
        }

        if !skip_integrity && (n != buf.len() || sha256(&[&buf[..n]]) != *h_val) {
            return Err(StoreError::CorruptedData("value digest mismatch"));
        }
        Ok(n)
    }

    fn export_tx(
        &self,
        tx_id: u64,
        allow_precommitted: bool,
        skip_integrity: bool,
    ) -> Result<Vec<u8>> {
        let mut holder = self.fetch_alloc_tx()?;
        self.read_tx_into(tx_id, allow_precommitted, skip_integrity, &mut holder)?;

        let hdr_bs = holder.header.to_bytes();
        let mut out = Vec::with_capacity(4 + hdr_bs.len() + 64);
        out.extend_from_slice(&(hdr_bs.len() as u32).to_be_bytes());
        out.extend_from_slice(&hdr_bs);

        let mut truncated = false;
        {
            let mut vbuf = self.val_buf.lock();
            for (i, e) in holder.entries().iter().enumerate() {
                out.extend_from_slice(&(e.key().len() as u16).to_be_bytes());
                out.extend_from_slice(e.key());

                let md = e.metadata().map(|m| m.to_bytes()).unwrap_or_default();
                out.extend_from_slice(&(md.len() as u16).to_be_bytes());
                out.extend_from_slice(&md);

                let v_len = e.v_len() as usize;
                match self.read_value_into(&mut vbuf[..v_len], e.v_off(), &e.h_val(), skip_integrity)
                {
                    Ok(_) => {
                        if truncated {
                            // either all values are sent or none
                            return Err(StoreError::CorruptedData(
                                "partially truncated transaction",
                            ));
                        }
                        out.extend_from_slice(&(v_len as u32).to_be_bytes());
                        out.extend_from_slice(&vbuf[..v_len]);
                    }
                    Err(StoreError::UnexpectedEof) | Err(StoreError::OffsetOutOfRange) => {
                        // the value log no longer holds the value; ship its
                        // digest instead
                        if !truncated && i > 0 {
                            return Err(StoreError::CorruptedData(
                                "partially truncated transaction",
                            ));
                        }
                        truncated = true;
                        let h_val = e.h_val();
                        out.extend_from_slice(&(h_val.len() as u32).to_be_bytes());
                        out.extend_from_slice(&h_val);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        out.extend_from_slice(&1u16.to_be_bytes());
        out.push(truncated as u8);
        Ok(out)
    }

    fn replicate_tx(
        &self,
        exported: &[u8],
        skip_integrity: bool,
        wait_for_indexing: bool,
        cancel: Option<&Cancellation>,
    ) -> Result<TxHeader> {
        if exported.is_empty() {
            return Err(StoreError::IllegalArgument("empty exported tx"));
        }

        fn take<'a>(bs: &'a [u8], i: &mut usize, n: usize) -> Result<&'a [u8]> {
            if bs.len() < *i + n {
                return Err(StoreError::IllegalArgument("malformed exported tx"));
            }
            let out = &bs[*i..*i + n];
            *i += n;
            Ok(out)
        }

        let mut i = 0usize;
        let hdr_len =
            u32::from_be_bytes(take(exported, &mut i, 4)?.try_into().expect("sized")) as usize;
        let hdr = TxHeader::read_from(take(exported, &mut i, hdr_len)?)?;

        struct ParsedEntry {
            key: Bytes,
            md: Option<crate::tx::KVMetadata>,
            payload: Bytes,
        }

        let mut entries = Vec::with_capacity(hdr.nentries as usize);
        for _ in 0..hdr.nentries {
            let k_len = u16::from_be_bytes(take(exported, &mut i, 2)?.try_into().expect("sized")) as usize;
            let key = Bytes::copy_from_slice(take(exported, &mut i, k_len)?);
            let md_len = u16::from_be_bytes(take(exported, &mut i, 2)?.try_into().expect("sized")) as usize;
            let md = if md_len > 0 {
                Some(crate::tx::KVMetadata::from_bytes(take(exported, &mut i, md_len)?)?)
            } else {
                None
            };
            let p_len = u32::from_be_bytes(take(exported, &mut i, 4)?.try_into().expect("sized")) as usize;
            let payload = Bytes::copy_from_slice(take(exported, &mut i, p_len)?);
            entries.push(ParsedEntry { key, md, payload });
        }

        let mut truncated = false;
        if i < exported.len() {
            let flag_len = u16::from_be_bytes(take(exported, &mut i, 2)?.try_into().expect("sized")) as usize;
            let flag = take(exported, &mut i, flag_len)?;
            if flag.len() != 1 || flag[0] > 1 {
                return Err(StoreError::IllegalArgument("invalid truncation flag"));
            }
            truncated = flag[0] == 1;
        }
        if i != exported.len() {
            return Err(StoreError::IllegalArgument("malformed exported tx"));
        }

        let mut otx = OngoingTx::new(TxMode::WriteOnly, 0);
        otx.metadata = hdr.metadata.clone();
        for e in entries {
            if truncated {
                let h_val: Digest = e
                    .payload
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::IllegalArgument("invalid value digest"))?;
                otx.push_entry(EntrySpec::truncated(e.key, e.md, h_val))?;
            } else {
                otx.push_entry(EntrySpec::with_metadata(e.key, e.md, e.payload))?;
            }
        }

        let committed_hdr = self.precommit_otx(&mut otx, Some(&hdr), skip_integrity, cancel)?;

        // syncing must happen before the header is exposed
        self.durable_precommit_whub
            .wait_for(committed_hdr.id, cancel)?;

        let use_external = self.commit_state.read().use_external_commit_allowance;
        if !use_external {
            self.commit_whub.wait_for(committed_hdr.id, cancel)?;
            if wait_for_indexing {
                self.wait_for_indexing(committed_hdr.id, cancel)?;
            }
        }

        Ok(committed_hdr)
    }

    fn linear_proof(&self, source_tx_id: u64, target_tx_id: u64) -> Result<LinearProof> {
        if source_tx_id == 0 || source_tx_id > target_tx_id {
            return Err(StoreError::SourceTxNewerThanTargetTx);
        }
        let mut holder = self.fetch_alloc_tx()?;
        let mut terms = Vec::with_capacity((target_tx_id - source_tx_id + 1) as usize);

        self.read_tx_into(source_tx_id, false, false, &mut holder)?;
        terms.push(holder.header.alh());

        for tx_id in source_tx_id + 1..=target_tx_id {
            self.read_tx_into(tx_id, false, false, &mut holder)?;
            terms.push(holder.header.inner_hash());
        }

        Ok(LinearProof {
            source_tx_id,
            target_tx_id,
            terms,
        })
    }

    /// Inclusion proofs for the segment `(source_tx_id, target_tx_id)` that
    /// the target tree already covers.
    fn linear_advance_proof(
        &self,
        source_tx_id: u64,
        target_tx_id: u64,
        target_bl_tx_id: u64,
    ) -> Result<Option<LinearAdvanceProof>> {
        if target_tx_id < source_tx_id {
            return Err(StoreError::SourceTxNewerThanTargetTx);
        }
        if target_tx_id <= source_tx_id + 1 {
            return Ok(None);
        }

        let mut holder = self.fetch_alloc_tx()?;
        self.read_tx_into(source_tx_id + 1, false, false, &mut holder)?;

        let mut terms = Vec::with_capacity((target_tx_id - source_tx_id) as usize);
        terms.push(holder.header.alh());
        let mut inclusion_proofs =
            Vec::with_capacity((target_tx_id - source_tx_id - 1) as usize);

        for tx_id in source_tx_id + 1..target_tx_id {
            inclusion_proofs.push(self.aht.inclusion_proof(tx_id, target_bl_tx_id)?);
            self.read_tx_into(tx_id + 1, false, false, &mut holder)?;
            terms.push(holder.header.inner_hash());
        }

        Ok(Some(LinearAdvanceProof {
            linear_proof_terms: terms,
            inclusion_proofs,
        }))
    }

    fn dual_proof(&self, source: &TxHeader, target: &TxHeader) -> Result<DualProof> {
        if source.id == 0 || target.id == 0 {
            return Err(StoreError::IllegalArgument("invalid tx header"));
        }
        if source.id > target.id {
            return Err(StoreError::SourceTxNewerThanTargetTx);
        }
        if source.bl_tx_id > target.bl_tx_id {
            return Err(StoreError::CorruptedTxData("binary linking mismatch"));
        }

        let inclusion_proof = if source.id < target.bl_tx_id {
            self.aht.inclusion_proof(source.id, target.bl_tx_id)?
        } else {
            Vec::new()
        };

        let consistency_proof = if source.bl_tx_id > 0 {
            self.aht.consistency_proof(source.bl_tx_id, target.bl_tx_id)?
        } else {
            Vec::new()
        };

        let (target_bl_tx_alh, last_inclusion_proof) = if target.bl_tx_id > 0 {
            let bl_hdr = self.read_tx_header(target.bl_tx_id, false, false)?;
            (
                bl_hdr.alh(),
                self.aht.inclusion_proof(target.bl_tx_id, target.bl_tx_id)?,
            )
        } else {
            ([0u8; 32], Vec::new())
        };

        let linear_proof =
            self.linear_proof(source.id.max(target.bl_tx_id), target.id)?;

        let linear_advance_proof = self.linear_advance_proof(
            source.bl_tx_id,
            source.id.min(target.bl_tx_id),
            target.bl_tx_id,
        )?;

        Ok(DualProof {
            source_tx_header: source.clone(),
            target_tx_header: target.clone(),
            inclusion_proof,
            consistency_proof,
            target_bl_tx_alh,
            last_inclusion_proof,
            linear_proof,
            linear_advance_proof,
        })
    }

    fn discard_precommitted_txs_since(&self, tx_id: u64) -> Result<usize> {
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }
        let mut st = self.commit_state.write();

        if tx_id == 0 {
            return Err(StoreError::IllegalArgument("invalid tx id"));
        }
        if tx_id <= st.committed_tx_id {
            return Err(StoreError::IllegalArgument(
                "only precommitted transactions can be discarded",
            ));
        }
        if tx_id > st.inmem_precommitted_tx_id {
            return Ok(0);
        }

        let to_discard = (st.inmem_precommitted_tx_id + 1 - tx_id) as usize;

        self.aht.reset_size(self.aht.size() - to_discard as u64)?;
        // the ring buffer holds every precommitted tx, durable ones included
        self.clog_buf.recede_writer(to_discard)?;

        if tx_id - 1 == st.committed_tx_id {
            st.inmem_precommitted_tx_id = st.committed_tx_id;
            st.inmem_precommitted_alh = st.committed_alh;
            return Ok(to_discard);
        }

        let idx = (st.inmem_precommitted_tx_id - st.committed_tx_id - 1) as usize - to_discard;
        match self.clog_buf.read_ahead(idx) {
            Ok(e) if e.tx_id == tx_id - 1 => {
                st.inmem_precommitted_tx_id = tx_id - 1;
                st.inmem_precommitted_alh = e.alh;
                Ok(to_discard)
            }
            other => {
                st.inmem_precommitted_tx_id = st.committed_tx_id;
                st.inmem_precommitted_alh = st.committed_alh;
                tracing::warn!("precommit buffer out of step while discarding, tail dropped");
                other.map(|_| to_discard)
            }
        }
    }

    fn truncate_upto_tx(&self, min_tx_id: u64) -> Result<()> {
        let committed = self.last_committed_tx_id();
        if min_tx_id == 0 || min_tx_id > committed {
            return Err(StoreError::IllegalArgument("invalid truncation point"));
        }

        tracing::info!(min_tx = min_tx_id, "running value-log truncation");

        // conservative floor: walk backward until every value log was seen
        let mut tombstones: HashMap<u8, u64> = HashMap::new();
        let mut tx_id = min_tx_id;
        while tx_id > 0 && tombstones.len() != self.vlog_pool.count() {
            match self.tx_entry_at(tx_id, 0) {
                Ok(e) => {
                    let (vlog_id, offset) = decode_offset(e.v_off());
                    if vlog_id > 0 {
                        tombstones.entry(vlog_id).or_insert(offset);
                    }
                }
                Err(StoreError::TxEntryIndexOutOfRange) => {}
                Err(e) => {
                    tracing::error!(tx = tx_id, error = %e, "truncation backward scan failed");
                    return Err(e);
                }
            }
            tx_id -= 1;
        }

        // a later tx may have written below the floor; lower it
        for tx_id in min_tx_id..=committed {
            match self.tx_entry_at(tx_id, 0) {
                Ok(e) => {
                    let (vlog_id, offset) = decode_offset(e.v_off());
                    if vlog_id > 0 {
                        if let Some(floor) = tombstones.get_mut(&vlog_id) {
                            if offset < *floor {
                                *floor = offset;
                            }
                        }
                    }
                }
                Err(StoreError::TxEntryIndexOutOfRange) => {}
                Err(e) => {
                    tracing::error!(tx = tx_id, error = %e, "truncation forward scan failed");
                    return Err(e);
                }
            }
        }

        let mut errs = Vec::new();
        for (vlog_id, offset) in tombstones {
            self.vlog_pool.fetch(vlog_id);
            tracing::info!(vlog = vlog_id, offset, "truncating value log");
            if let Err(e) = self.vlog_pool.log(vlog_id).discard_upto(offset) {
                errs.push(e);
            }
            self.vlog_pool.release(vlog_id);
        }
        StoreError::reduce(errs)
    }

    fn committed_entries(&self, tx_id: u64, holder: &mut Tx) -> Result<(TxHeader, Vec<IndexedEntry>)> {
        self.read_tx_into(tx_id, false, false, holder)?;
        let entries = holder
            .entries()
            .iter()
            .map(|e| IndexedEntry {
                key: Bytes::copy_from_slice(e.key()),
                md: e.metadata().cloned(),
                v_len: e.v_len(),
                v_off: e.v_off(),
                h_val: e.h_val(),
            })
            .collect();
        Ok((holder.header.clone(), entries))
    }

    fn close_impl(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }
        state.closed = true;
        self.close_cancel.cancel();

        let mut errs = Vec::new();
        let mut push = |r: Result<()>| {
            if let Err(e) = r {
                if !matches!(e, StoreError::AlreadyClosed) {
                    errs.push(e);
                }
            }
        };

        push(self.inmem_precommit_whub.close());
        push(self.durable_precommit_whub.close());
        push(self.commit_whub.close());

        if let Some(handle) = self.syncer.lock().take() {
            let _ = handle.join();
        }

        for id in 1..=self.vlog_pool.count() as u8 {
            self.vlog_pool.fetch(id);
            push(self.vlog_pool.log(id).close());
            self.vlog_pool.release(id);
        }

        if let Some(indexer) = self.indexer.write().take() {
            push(indexer.close());
        }

        push(self.tx_log.close());
        push(self.clog.close());
        push(self.aht.close());

        if self.tx_pool.in_use() > 0 {
            errs.push(StoreError::IllegalState("not all tx holders were released"));
        }

        StoreError::reduce(errs)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}

struct WaiteeGuard<'a> {
    counter: &'a Mutex<usize>,
}

impl Drop for WaiteeGuard<'_> {
    fn drop(&mut self) {
        *self.counter.lock() -= 1;
    }
}

/// Engine view handed to the index collaborator. Holds the engine weakly so
/// the collaborator cannot keep it alive, plus its own tx holder so indexing
/// never competes with writers for the pool.
struct WeakSource {
    inner: Weak<StoreInner>,
    commit_whub: Arc<WatchersHub>,
    holder: Mutex<Tx>,
}

impl TxSource for WeakSource {
    fn committed_up_to(&self) -> u64 {
        self.inner
            .upgrade()
            .map(|inner| inner.last_committed_tx_id())
            .unwrap_or(0)
    }

    fn wait_committed(&self, tx_id: u64, cancel: Option<&Cancellation>) -> Result<()> {
        self.commit_whub.wait_for(tx_id, cancel)
    }

    fn committed_entries(&self, tx_id: u64) -> Result<(TxHeader, Vec<IndexedEntry>)> {
        let inner = self.inner.upgrade().ok_or(StoreError::AlreadyClosed)?;
        let mut holder = self.holder.lock();
        inner.committed_entries(tx_id, &mut holder)
    }
}

fn syncer_loop(
    weak: Weak<StoreInner>,
    inmem_whub: Arc<WatchersHub>,
    cancel: Cancellation,
    freq: Duration,
) {
    loop {
        let committed = match weak.upgrade() {
            Some(inner) => inner.last_committed_tx_id(),
            None => return,
        };

        // passive wait for at least one new precommitted tx
        if inmem_whub.wait_for(committed + 1, Some(&cancel)).is_err() {
            return;
        }

        // give writers a few slices to precommit more before paying a sync
        let mut prev = committed + 1;
        for _ in 0..4 {
            std::thread::sleep(freq / 4);
            let latest = match weak.upgrade() {
                Some(inner) => inner.last_precommitted_tx_id(),
                None => return,
            };
            if prev == latest {
                break;
            }
            prev = latest;
        }

        match weak.upgrade() {
            Some(inner) => match inner.sync_internal() {
                Ok(()) => {}
                Err(StoreError::AlreadyClosed) | Err(StoreError::Cancelled) => return,
                Err(e) => tracing::error!(error = %e, "syncing transactions failed"),
            },
            None => return,
        }
    }
}
