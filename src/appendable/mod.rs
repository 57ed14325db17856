//! Chunked append-only log files.
//!
//! A log is a directory of fixed-capacity chunk files, each carrying a small
//! self-describing header:
//!
//! ```text
//! [magic 8B "LDBCHNK1"]
//! [chunk payload capacity u64 BE]
//! [metadata_len u32 BE][metadata bytes]
//! [payload...]
//! ```
//!
//! Offsets handed to callers are logical payload offsets spanning the whole
//! chunk sequence; chunk `i` holds `[i*capacity, (i+1)*capacity)`. Appends go
//! through a write buffer; `flush` persists buffered bytes with positional
//! writes and `sync` fsyncs every chunk touched since the last successful
//! sync (a failed fsync keeps the dirty set, so sync is retryable).
//!
//! `set_offset` moves the logical end backwards so partially written tails
//! can be overwritten in place. `discard_upto` deletes whole chunks below an
//! offset; reads below the discard floor report `OffsetOutOfRange`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

const MAGIC: &[u8; 8] = b"LDBCHNK1";

/// Typed key-value metadata persisted in every chunk header.
///
/// Values written at creation time are immutable for the lifetime of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: BTreeMap<String, u64>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_int(&mut self, key: &str, value: u64) -> &mut Self {
        self.entries.insert(key.to_string(), value);
        self
    }

    pub fn get_int(&self, key: &str) -> Option<u64> {
        self.entries.get(key).copied()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("metadata serialization cannot fail")
    }

    pub fn from_bytes(bs: &[u8]) -> Result<Self> {
        bincode::deserialize(bs).map_err(|_| StoreError::CorruptedData("log metadata"))
    }
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Payload capacity of each chunk file.
    pub file_size: u64,
    /// Metadata stored in chunk headers. Ignored when the log already exists.
    pub metadata: Vec<u8>,
    pub write_buffer_size: usize,
    pub max_opened_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            file_size: 1 << 29,
            metadata: Vec::new(),
            write_buffer_size: 1 << 22,
            max_opened_files: 10,
        }
    }
}

/// Append-only byte stream over chunked files. All methods are `&self`; the
/// log carries its own lock so it can be shared across writer and reader
/// threads.
pub struct AppendableLog {
    dir: PathBuf,
    ext: String,
    inner: Mutex<LogInner>,
}

struct LogInner {
    file_size: u64,
    metadata: Vec<u8>,
    header_len: u64,
    /// Logical end of the log (next append position).
    size: u64,
    /// Start of the write buffer; bytes below this are on disk.
    wbuf_base: u64,
    wbuf: Vec<u8>,
    wbuf_cap: usize,
    /// First readable logical offset (chunks below it were discarded).
    discarded_upto: u64,
    /// Chunks written since the last successful fsync.
    dirty: BTreeSet<u64>,
    files: LruCache<u64, Arc<File>>,
    closed: bool,
}

impl AppendableLog {
    pub fn open(dir: impl AsRef<Path>, ext: &str, opts: LogOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut chunk_ids: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(&format!(".{ext}")) {
                if let Ok(id) = stem.parse::<u64>() {
                    chunk_ids.push(id);
                }
            }
        }
        chunk_ids.sort_unstable();

        let mut inner = LogInner {
            file_size: opts.file_size,
            metadata: opts.metadata,
            header_len: 0,
            size: 0,
            wbuf_base: 0,
            wbuf: Vec::with_capacity(opts.write_buffer_size.max(1)),
            wbuf_cap: opts.write_buffer_size.max(1),
            discarded_upto: 0,
            dirty: BTreeSet::new(),
            files: LruCache::new(
                NonZeroUsize::new(opts.max_opened_files.max(1)).expect("non-zero"),
            ),
            closed: false,
        };

        let log = match (chunk_ids.first(), chunk_ids.last()) {
            (Some(&first), Some(&last)) => {
                // Existing log: the stored header wins over passed options.
                let first_path = chunk_path(&dir, ext, first);
                let (file_size, metadata) = read_chunk_header(&first_path)?;
                inner.file_size = file_size;
                inner.header_len = header_len(&metadata);
                inner.metadata = metadata;
                inner.discarded_upto = first * file_size;

                let last_path = chunk_path(&dir, ext, last);
                let phys = fs::metadata(&last_path)?.len();
                if phys < inner.header_len {
                    return Err(StoreError::CorruptedData("truncated chunk header"));
                }
                let tail = (phys - inner.header_len).min(file_size);
                inner.size = last * file_size + tail;
                inner.wbuf_base = inner.size;
                Self {
                    dir,
                    ext: ext.to_string(),
                    inner: Mutex::new(inner),
                }
            }
            _ => {
                inner.header_len = header_len(&inner.metadata);
                let log = Self {
                    dir,
                    ext: ext.to_string(),
                    inner: Mutex::new(inner),
                };
                // Materialize the first chunk so metadata survives a reopen
                // even before the first append.
                {
                    let mut guard = log.inner.lock();
                    log.chunk_file(&mut guard, 0)?;
                }
                log
            }
        };

        Ok(log)
    }

    pub fn metadata(&self) -> Vec<u8> {
        self.inner.lock().metadata.clone()
    }

    pub fn size(&self) -> Result<u64> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        Ok(inner.size)
    }

    /// Appends `bs` and returns the logical offset it was written at.
    pub fn append(&self, bs: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        if bs.is_empty() {
            return Err(StoreError::IllegalArgument("empty append"));
        }
        let off = inner.size;
        inner.wbuf.extend_from_slice(bs);
        inner.size += bs.len() as u64;
        if inner.wbuf.len() >= inner.wbuf_cap {
            self.flush_locked(&mut inner)?;
        }
        Ok(off)
    }

    /// Moves the logical end backwards (or keeps it); following appends
    /// overwrite whatever tail bytes were there.
    pub fn set_offset(&self, off: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        if off > inner.size {
            return Err(StoreError::IllegalArgument("offset beyond log size"));
        }
        if off >= inner.wbuf_base {
            let keep = (off - inner.wbuf_base) as usize;
            inner.wbuf.truncate(keep);
        } else {
            self.flush_locked(&mut inner)?;
            inner.wbuf.clear();
            inner.wbuf_base = off;
        }
        inner.size = off;
        Ok(())
    }

    /// Best-effort read of up to `buf.len()` bytes at `off`. Returns the
    /// number of bytes read, short only when crossing the logical end.
    pub fn read_at(&self, buf: &mut [u8], off: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        if off < inner.discarded_upto {
            return Err(StoreError::OffsetOutOfRange);
        }
        if off >= inner.size {
            return Err(StoreError::UnexpectedEof);
        }
        let want = (buf.len() as u64).min(inner.size - off) as usize;
        let mut done = 0usize;
        while done < want {
            let cur = off + done as u64;
            if cur >= inner.wbuf_base {
                let start = (cur - inner.wbuf_base) as usize;
                let n = want - done;
                buf[done..done + n].copy_from_slice(&inner.wbuf[start..start + n]);
                done += n;
                break;
            }
            let chunk = cur / inner.file_size;
            let in_off = cur % inner.file_size;
            let n = ((want - done) as u64)
                .min(inner.file_size - in_off)
                .min(inner.wbuf_base - cur) as usize;
            let header_len = inner.header_len;
            let file = self.chunk_file(&mut inner, chunk)?;
            file.read_exact_at(&mut buf[done..done + n], header_len + in_off)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => StoreError::UnexpectedEof,
                    _ => StoreError::Io(e),
                })?;
            done += n;
        }
        Ok(want)
    }

    pub fn read_exact_at(&self, buf: &mut [u8], off: u64) -> Result<()> {
        let n = self.read_at(buf, off)?;
        if n < buf.len() {
            return Err(StoreError::UnexpectedEof);
        }
        Ok(())
    }

    /// Sequential reader positioned at `off`.
    pub fn reader_at(&self, off: u64) -> Reader<'_> {
        Reader {
            log: self,
            off,
            count: 0,
        }
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        self.flush_locked(&mut inner)
    }

    /// Flush + fsync of every chunk touched since the last successful sync.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        self.flush_locked(&mut inner)?;
        while let Some(&chunk) = inner.dirty.iter().next() {
            let file = self.chunk_file(&mut inner, chunk)?;
            file.sync_data()?;
            inner.dirty.remove(&chunk);
        }
        Ok(())
    }

    /// Deletes chunk files wholly below `off`, making room reclaimable.
    pub fn discard_upto(&self, off: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        if off > inner.size {
            return Err(StoreError::IllegalArgument("discard offset beyond log size"));
        }
        self.flush_locked(&mut inner)?;
        let floor_chunk = off / inner.file_size;
        let first_chunk = inner.discarded_upto / inner.file_size;
        for chunk in first_chunk..floor_chunk {
            let path = chunk_path(&self.dir, &self.ext, chunk);
            inner.files.pop(&chunk);
            inner.dirty.remove(&chunk);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        inner.discarded_upto = inner.discarded_upto.max(floor_chunk * inner.file_size);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        let flushed = self.flush_locked(&mut inner);
        inner.closed = true;
        inner.files.clear();
        flushed
    }

    fn flush_locked(&self, inner: &mut LogInner) -> Result<()> {
        if inner.wbuf.is_empty() {
            inner.wbuf_base = inner.size;
            return Ok(());
        }
        let buf = std::mem::take(&mut inner.wbuf);
        let base = inner.wbuf_base;
        match self.write_span(inner, base, &buf) {
            Ok(()) => {
                inner.wbuf_base += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Positional writes make the retry idempotent.
                inner.wbuf = buf;
                Err(e)
            }
        }
    }

    fn write_span(&self, inner: &mut LogInner, mut off: u64, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let chunk = off / inner.file_size;
            let in_off = off % inner.file_size;
            let n = (data.len() as u64).min(inner.file_size - in_off) as usize;
            let header_len = inner.header_len;
            let file = self.chunk_file(inner, chunk)?;
            file.write_all_at(&data[..n], header_len + in_off)?;
            inner.dirty.insert(chunk);
            off += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    fn chunk_file(&self, inner: &mut LogInner, chunk: u64) -> Result<Arc<File>> {
        if let Some(f) = inner.files.get(&chunk) {
            return Ok(f.clone());
        }
        let path = chunk_path(&self.dir, &self.ext, chunk);
        let create = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if create {
            let mut header = Vec::with_capacity(header_len(&inner.metadata) as usize);
            header.extend_from_slice(MAGIC);
            header.extend_from_slice(&inner.file_size.to_be_bytes());
            header.extend_from_slice(&(inner.metadata.len() as u32).to_be_bytes());
            header.extend_from_slice(&inner.metadata);
            file.write_all_at(&header, 0)?;
            inner.dirty.insert(chunk);
        }
        let file = Arc::new(file);
        inner.files.put(chunk, file.clone());
        Ok(file)
    }
}

pub struct Reader<'a> {
    log: &'a AppendableLog,
    off: u64,
    count: u64,
}

impl Reader<'_> {
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.log.read_exact_at(buf, self.off)?;
        self.off += buf.len() as u64;
        self.count += buf.len() as u64;
        Ok(())
    }

    /// Bytes consumed since the reader was created.
    pub fn read_count(&self) -> u64 {
        self.count
    }

    pub fn offset(&self) -> u64 {
        self.off
    }
}

fn header_len(metadata: &[u8]) -> u64 {
    (MAGIC.len() + 8 + 4 + metadata.len()) as u64
}

fn chunk_path(dir: &Path, ext: &str, chunk: u64) -> PathBuf {
    dir.join(format!("{chunk:016}.{ext}"))
}

fn read_chunk_header(path: &Path) -> Result<(u64, Vec<u8>)> {
    let file = File::open(path)?;
    let mut fixed = [0u8; 8 + 8 + 4];
    file.read_exact_at(&mut fixed, 0)
        .map_err(|_| StoreError::CorruptedData("truncated chunk header"))?;
    if &fixed[..8] != MAGIC {
        return Err(StoreError::CorruptedData("bad chunk magic"));
    }
    let file_size = u64::from_be_bytes(fixed[8..16].try_into().expect("sized"));
    if file_size == 0 {
        return Err(StoreError::CorruptedData("zero chunk capacity"));
    }
    let md_len = u32::from_be_bytes(fixed[16..20].try_into().expect("sized")) as usize;
    let mut md = vec![0u8; md_len];
    file.read_exact_at(&mut md, 20)
        .map_err(|_| StoreError::CorruptedData("truncated chunk metadata"))?;
    Ok((file_size, md))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_log(dir: &Path) -> AppendableLog {
        AppendableLog::open(
            dir,
            "val",
            LogOptions {
                file_size: 16,
                metadata: Metadata::new().put_int("VERSION", 1).to_bytes(),
                write_buffer_size: 8,
                max_opened_files: 2,
            },
        )
        .expect("open")
    }

    #[test]
    fn append_read_roundtrip_across_chunks() {
        let dir = TempDir::new().expect("tempdir");
        let log = small_log(dir.path());

        let off0 = log.append(b"0123456789").expect("append");
        let off1 = log.append(b"abcdefghij").expect("append");
        assert_eq!(off0, 0);
        assert_eq!(off1, 10);

        let mut buf = [0u8; 10];
        log.read_exact_at(&mut buf, 10).expect("read");
        assert_eq!(&buf, b"abcdefghij");

        // spans the 16-byte chunk boundary
        let mut buf = [0u8; 8];
        log.read_exact_at(&mut buf, 12).expect("read");
        assert_eq!(&buf, b"cdefghij");
    }

    #[test]
    fn reopen_recovers_size_and_metadata() {
        let dir = TempDir::new().expect("tempdir");
        {
            let log = small_log(dir.path());
            log.append(b"0123456789abcdefghij").expect("append");
            log.sync().expect("sync");
            log.close().expect("close");
        }
        let log = AppendableLog::open(dir.path(), "val", LogOptions::default()).expect("reopen");
        assert_eq!(log.size().expect("size"), 20);
        let md = Metadata::from_bytes(&log.metadata()).expect("metadata");
        assert_eq!(md.get_int("VERSION"), Some(1));

        let mut buf = [0u8; 20];
        log.read_exact_at(&mut buf, 0).expect("read");
        assert_eq!(&buf, b"0123456789abcdefghij");
    }

    #[test]
    fn set_offset_overwrites_tail() {
        let dir = TempDir::new().expect("tempdir");
        let log = small_log(dir.path());
        log.append(b"aaaa").expect("append");
        log.append(b"bbbb").expect("append");
        log.set_offset(4).expect("set offset");
        assert_eq!(log.size().expect("size"), 4);
        let off = log.append(b"cccc").expect("append");
        assert_eq!(off, 4);

        let mut buf = [0u8; 8];
        log.read_exact_at(&mut buf, 0).expect("read");
        assert_eq!(&buf, b"aaaacccc");
    }

    #[test]
    fn discard_upto_drops_whole_chunks() {
        let dir = TempDir::new().expect("tempdir");
        let log = small_log(dir.path());
        for _ in 0..4 {
            log.append(&[7u8; 16]).expect("append");
        }
        log.discard_upto(35).expect("discard");

        let mut buf = [0u8; 1];
        assert!(matches!(
            log.read_at(&mut buf, 0),
            Err(StoreError::OffsetOutOfRange)
        ));
        log.read_exact_at(&mut buf, 32).expect("read above floor");
    }

    #[test]
    fn read_past_end_reports_eof() {
        let dir = TempDir::new().expect("tempdir");
        let log = small_log(dir.path());
        log.append(b"xy").expect("append");
        let mut buf = [0u8; 4];
        assert!(matches!(
            log.read_at(&mut buf, 2),
            Err(StoreError::UnexpectedEof)
        ));
        let n = log.read_at(&mut buf, 0).expect("short read");
        assert_eq!(n, 2);
    }
}
