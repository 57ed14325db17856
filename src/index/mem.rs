//! Process-local in-memory indexer.
//!
//! A background thread consumes the engine's commit watcher and absorbs
//! committed transactions into a concurrent ordered map. State is rebuilt
//! from the transaction log on every open, so this indexer trades restart
//! cost for zero on-disk footprint; production deployments can plug their
//! own [`Indexer`](super::Indexer) implementation instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;

use super::{Filter, IndexedEntry, Indexer, KeyIndex, TxSource, ValueRef};
use crate::error::{Result, StoreError};
use crate::tx::KVMetadata;
use crate::watchers::{Cancellation, WatchersHub};
use crate::Digest;

pub(crate) type NowFn = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Clone)]
struct IndexedVal {
    tx: u64,
    v_len: u32,
    v_off: u64,
    h_val: Digest,
    md: Option<KVMetadata>,
}

struct MemInner {
    source: Arc<dyn TxSource>,
    map: SkipMap<Vec<u8>, Mutex<Vec<IndexedVal>>>,
    whub: WatchersHub,
    ts: AtomicU64,
    cancel: Cancellation,
    closed: AtomicBool,
    now: NowFn,
}

pub struct MemIndexer {
    inner: Arc<MemInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MemIndexer {
    pub(crate) fn start(source: Arc<dyn TxSource>, now: NowFn, max_waitees: usize) -> Arc<Self> {
        let inner = Arc::new(MemInner {
            source,
            map: SkipMap::new(),
            whub: WatchersHub::new(0, max_waitees),
            ts: AtomicU64::new(0),
            cancel: Cancellation::new(),
            closed: AtomicBool::new(false),
            now,
        });

        let worker = inner.clone();
        let handle = std::thread::Builder::new()
            .name("ledgerdb-indexer".into())
            .spawn(move || indexing_loop(worker))
            .expect("spawn indexer thread");

        Arc::new(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn latest(&self, key: &[u8]) -> Result<ValueRef> {
        let entry = self.inner.map.get(key).ok_or(StoreError::KeyNotFound)?;
        let versions = entry.value().lock();
        let last = versions.last().ok_or(StoreError::KeyNotFound)?;
        Ok(ValueRef {
            tx: last.tx,
            hc: versions.len() as u64,
            v_len: last.v_len,
            v_off: last.v_off,
            h_val: last.h_val,
            md: last.md.clone(),
        })
    }
}

impl KeyIndex for MemIndexer {
    fn get_with_filters(&self, key: &[u8], filters: &[Filter]) -> Result<ValueRef> {
        let vref = self.latest(key)?;
        let now = (self.inner.now)();
        for f in filters {
            f.check(&vref, now)?;
        }
        Ok(vref)
    }

    fn get_with_prefix_and_filters(
        &self,
        prefix: &[u8],
        neq: Option<&[u8]>,
        filters: &[Filter],
    ) -> Result<(Bytes, ValueRef)> {
        let now = (self.inner.now)();
        for entry in self.inner.map.range(prefix.to_vec()..) {
            let key = entry.key();
            if !key.starts_with(prefix) {
                break;
            }
            if matches!(neq, Some(neq) if key.as_slice() <= neq) {
                continue;
            }
            let vref = {
                let versions = entry.value().lock();
                match versions.last() {
                    Some(last) => ValueRef {
                        tx: last.tx,
                        hc: versions.len() as u64,
                        v_len: last.v_len,
                        v_off: last.v_off,
                        h_val: last.h_val,
                        md: last.md.clone(),
                    },
                    None => continue,
                }
            };
            match filters.iter().try_for_each(|f| f.check(&vref, now)) {
                Ok(()) => return Ok((Bytes::copy_from_slice(key), vref)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::KeyNotFound)
    }
}

impl Indexer for MemIndexer {
    fn indexed_upto(&self) -> u64 {
        self.inner.ts.load(Ordering::Acquire)
    }

    fn wait_for_indexing_upto(&self, tx_id: u64, cancel: Option<&Cancellation>) -> Result<()> {
        self.inner.whub.wait_for(tx_id, cancel)
    }

    fn history(
        &self,
        key: &[u8],
        offset: u64,
        desc: bool,
        limit: usize,
    ) -> Result<(Vec<u64>, u64)> {
        if limit == 0 {
            return Err(StoreError::IllegalArgument("history limit must be positive"));
        }
        let entry = self.inner.map.get(key).ok_or(StoreError::KeyNotFound)?;
        let versions = entry.value().lock();
        let hc = versions.len() as u64;
        if hc == 0 {
            return Err(StoreError::KeyNotFound);
        }
        if offset >= hc {
            return Err(StoreError::OffsetOutOfRange);
        }
        let txs: Vec<u64> = if desc {
            versions
                .iter()
                .rev()
                .skip(offset as usize)
                .take(limit)
                .map(|v| v.tx)
                .collect()
        } else {
            versions
                .iter()
                .skip(offset as usize)
                .take(limit)
                .map(|v| v.tx)
                .collect()
        };
        Ok((txs, hc))
    }

    fn compact(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::AlreadyClosed);
        }
        // Nothing to reclaim: versions live in memory only.
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::AlreadyClosed);
        }
        self.inner.cancel.cancel();
        let _ = self.inner.whub.close();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn indexing_loop(inner: Arc<MemInner>) {
    loop {
        let next = inner.ts.load(Ordering::Acquire) + 1;
        if inner
            .source
            .wait_committed(next, Some(&inner.cancel))
            .is_err()
        {
            break;
        }
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        let entries = match inner.source.committed_entries(next) {
            Ok((_, entries)) => entries,
            Err(StoreError::AlreadyClosed) => break,
            Err(e) => {
                tracing::error!(tx = next, error = %e, "indexing stopped on unreadable tx");
                break;
            }
        };
        absorb(&inner, next, entries);
        inner.ts.store(next, Ordering::Release);
        if inner.whub.done_upto(next).is_err() {
            break;
        }
    }
}

fn absorb(inner: &MemInner, tx_id: u64, entries: Vec<IndexedEntry>) {
    for e in entries {
        if e.md.as_ref().is_some_and(|md| md.non_indexable()) {
            continue;
        }
        let slot = inner
            .map
            .get_or_insert(e.key.to_vec(), Mutex::new(Vec::new()));
        slot.value().lock().push(IndexedVal {
            tx: tx_id,
            v_len: e.v_len,
            v_off: e.v_off,
            h_val: e.h_val,
            md: e.md,
        });
    }
}
