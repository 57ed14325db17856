//! Append-only hash tree over the sequence of accumulative transaction
//! hashes.
//!
//! Leaf `i` is the Alh of transaction `i` (1-based); leaves hash
//! `SHA-256(0x00 || Alh)` and interior nodes `SHA-256(0x01 || l || r)`, the
//! RFC-6962 shape, so inclusion and consistency proofs verify with the
//! standard algorithms.
//!
//! Leaves are persisted as crc-framed fixed records:
//!
//! ```text
//! [alh 32B][crc32c(alh) u32 BE]   x size
//! ```
//!
//! Interior levels live in memory and are rebuilt on open. A short or
//! corrupt tail is truncated away; the engine replays missing leaves from
//! the tx log afterwards, so tree durability is best-effort by design.
//! `reset_size` only ever rolls back uncommitted growth.

use std::path::Path;

use parking_lot::RwLock;

use crate::appendable::{AppendableLog, LogOptions, Metadata};
use crate::error::{Result, StoreError};
use crate::htree::{leaf_digest, node_digest};
use crate::Digest;

const RECORD_SIZE: u64 = 36;

/// Leaf hash for an accumulative tx hash.
pub fn alh_leaf(alh: &Digest) -> Digest {
    leaf_digest(&[alh.as_slice()])
}

#[derive(Debug, Clone)]
pub struct AhtOptions {
    pub file_size: u64,
    pub write_buffer_size: usize,
}

impl Default for AhtOptions {
    fn default() -> Self {
        Self {
            file_size: 1 << 29,
            write_buffer_size: 1 << 16,
        }
    }
}

pub struct AHTree {
    inner: RwLock<AhtInner>,
}

struct AhtInner {
    /// `levels[l][j]` covers leaves `[j*2^l, (j+1)*2^l)`;
    /// `levels[l].len() == size >> l`.
    levels: Vec<Vec<Digest>>,
    log: AppendableLog,
    closed: bool,
}

impl AHTree {
    pub fn open(dir: impl AsRef<Path>, opts: AhtOptions) -> Result<Self> {
        let log = AppendableLog::open(
            dir,
            "aht",
            LogOptions {
                file_size: opts.file_size,
                metadata: Metadata::new().put_int("VERSION", 1).to_bytes(),
                write_buffer_size: opts.write_buffer_size,
                max_opened_files: 4,
            },
        )?;

        let mut inner = AhtInner {
            levels: vec![Vec::new()],
            log,
            closed: false,
        };

        let stored = inner.log.size()? / RECORD_SIZE;
        let mut rec = [0u8; RECORD_SIZE as usize];
        let mut good = 0u64;
        for i in 0..stored {
            inner.log.read_exact_at(&mut rec, i * RECORD_SIZE)?;
            let alh: Digest = rec[..32].try_into().expect("sized");
            let crc = u32::from_be_bytes(rec[32..36].try_into().expect("sized"));
            if crc != crc32c::crc32c(&alh) {
                tracing::warn!(leaf = i + 1, "hash tree leaf with bad checksum, truncating");
                break;
            }
            inner.push_leaf(alh_leaf(&alh));
            good += 1;
        }
        if good < stored || inner.log.size()? % RECORD_SIZE != 0 {
            inner.log.set_offset(good * RECORD_SIZE)?;
        }

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    pub fn size(&self) -> u64 {
        self.inner.read().levels[0].len() as u64
    }

    /// Appends the next leaf and returns the new tree size.
    pub fn append(&self, alh: Digest) -> Result<u64> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        let mut rec = [0u8; RECORD_SIZE as usize];
        rec[..32].copy_from_slice(&alh);
        rec[32..].copy_from_slice(&crc32c::crc32c(&alh).to_be_bytes());
        inner.log.append(&rec)?;
        inner.push_leaf(alh_leaf(&alh));
        Ok(inner.levels[0].len() as u64)
    }

    pub fn root(&self) -> Result<Digest> {
        let inner = self.inner.read();
        let size = inner.levels[0].len() as u64;
        if size == 0 {
            return Err(StoreError::IllegalState("empty hash tree"));
        }
        Ok(inner.node(0, size))
    }

    /// Root of the tree as it was at size `n`.
    pub fn root_at(&self, n: u64) -> Result<Digest> {
        let inner = self.inner.read();
        if n == 0 || n > inner.levels[0].len() as u64 {
            return Err(StoreError::IllegalArgument("tree size out of range"));
        }
        Ok(inner.node(0, n))
    }

    /// Audit path of leaf `i` in the tree of size `n` (both 1-based,
    /// `i <= n <= size`), ordered leaf level upwards.
    pub fn inclusion_proof(&self, i: u64, n: u64) -> Result<Vec<Digest>> {
        let inner = self.inner.read();
        if i == 0 || i > n || n > inner.levels[0].len() as u64 {
            return Err(StoreError::IllegalArgument("inclusion proof out of range"));
        }
        let mut out = Vec::new();
        inner.path(i - 1, 0, n, &mut out);
        Ok(out)
    }

    /// Consistency path between tree sizes `m <= n` (1-based).
    pub fn consistency_proof(&self, m: u64, n: u64) -> Result<Vec<Digest>> {
        let inner = self.inner.read();
        if m == 0 || m > n || n > inner.levels[0].len() as u64 {
            return Err(StoreError::IllegalArgument(
                "consistency proof out of range",
            ));
        }
        let mut out = Vec::new();
        inner.subproof(m, 0, n, true, &mut out);
        Ok(out)
    }

    /// Rolls back to `s` leaves. Only uncommitted growth may be discarded;
    /// enforcing that is the caller's responsibility.
    pub fn reset_size(&self, s: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        if s > inner.levels[0].len() as u64 {
            return Err(StoreError::IllegalArgument("cannot grow through reset"));
        }
        for l in 0..inner.levels.len() {
            let keep = (s >> l) as usize;
            inner.levels[l].truncate(keep);
        }
        while inner.levels.len() > 1 && inner.levels.last().expect("non-empty").is_empty() {
            inner.levels.pop();
        }
        inner.log.set_offset(s * RECORD_SIZE)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.read().log.flush()
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.read().log.sync()
    }

    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StoreError::AlreadyClosed);
        }
        inner.closed = true;
        inner.log.close()
    }
}

impl AhtInner {
    fn push_leaf(&mut self, leaf: Digest) {
        self.levels[0].push(leaf);
        let mut l = 0;
        loop {
            let n = self.levels[l].len();
            if n % 2 != 0 {
                break;
            }
            let parent = node_digest(&self.levels[l][n - 2], &self.levels[l][n - 1]);
            if self.levels.len() == l + 1 {
                self.levels.push(Vec::new());
            }
            self.levels[l + 1].push(parent);
            l += 1;
        }
    }

    /// Merkle hash of leaves `[from, from+size)`; complete aligned subtrees
    /// come straight from the stored levels.
    fn node(&self, from: u64, size: u64) -> Digest {
        if size.is_power_of_two() && from % size == 0 {
            let l = size.trailing_zeros() as usize;
            return self.levels[l][(from >> l) as usize];
        }
        let k = largest_pow2_lt(size);
        node_digest(&self.node(from, k), &self.node(from + k, size - k))
    }

    fn path(&self, m: u64, from: u64, size: u64, out: &mut Vec<Digest>) {
        if size == 1 {
            return;
        }
        let k = largest_pow2_lt(size);
        if m < k {
            self.path(m, from, k, out);
            out.push(self.node(from + k, size - k));
        } else {
            self.path(m - k, from + k, size - k, out);
            out.push(self.node(from, k));
        }
    }

    fn subproof(&self, m: u64, from: u64, size: u64, complete: bool, out: &mut Vec<Digest>) {
        if m == size {
            if !complete {
                out.push(self.node(from, size));
            }
            return;
        }
        let k = largest_pow2_lt(size);
        if m <= k {
            self.subproof(m, from, k, complete, out);
            out.push(self.node(from + k, size - k));
        } else {
            self.subproof(m - k, from + k, size - k, false, out);
            out.push(self.node(from, k));
        }
    }
}

fn largest_pow2_lt(n: u64) -> u64 {
    debug_assert!(n >= 2);
    1u64 << (63 - (n - 1).leading_zeros())
}

/// Verifies an audit path for the 0-based `leaf_index` in a tree of `size`
/// leaves (RFC 9162 inclusion verification).
pub fn verify_inclusion(
    path: &[Digest],
    leaf_index: u64,
    size: u64,
    leaf: Digest,
    root: Digest,
) -> bool {
    if leaf_index >= size {
        return false;
    }
    let mut fnode = leaf_index;
    let mut sn = size - 1;
    let mut calc = leaf;
    for c in path {
        if sn == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == sn {
            calc = node_digest(c, &calc);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    sn >>= 1;
                }
            }
        } else {
            calc = node_digest(&calc, c);
        }
        fnode >>= 1;
        sn >>= 1;
    }
    sn == 0 && calc == root
}

/// Verifies that the last leaf of a tree of `size` leaves is `leaf`.
pub fn verify_last_inclusion(path: &[Digest], size: u64, leaf: Digest, root: Digest) -> bool {
    size > 0 && verify_inclusion(path, size - 1, size, leaf, root)
}

/// Verifies a consistency path between tree sizes `old_size <= new_size`
/// (RFC 9162 consistency verification).
pub fn verify_consistency(
    path: &[Digest],
    old_size: u64,
    new_size: u64,
    old_root: Digest,
    new_root: Digest,
) -> bool {
    if old_size == new_size {
        return path.is_empty() && old_root == new_root;
    }
    if old_size == 0 || old_size > new_size {
        return false;
    }
    let mut node = old_size - 1;
    let mut last = new_size - 1;
    while node & 1 == 1 {
        node >>= 1;
        last >>= 1;
    }
    let mut terms = path.iter();
    let (mut fr, mut sr) = if node > 0 {
        match terms.next() {
            Some(c) => (*c, *c),
            None => return false,
        }
    } else {
        (old_root, old_root)
    };
    for c in terms {
        if last == 0 {
            return false;
        }
        if node & 1 == 1 || node == last {
            fr = node_digest(c, &fr);
            sr = node_digest(c, &sr);
            while node & 1 == 0 && node != 0 {
                node >>= 1;
                last >>= 1;
            }
        } else {
            sr = node_digest(&sr, c);
        }
        node >>= 1;
        last >>= 1;
    }
    fr == old_root && sr == new_root && last == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn alh(i: u64) -> Digest {
        crate::sha256(&[&i.to_be_bytes()])
    }

    fn tree_with(dir: &Path, n: u64) -> AHTree {
        let t = AHTree::open(dir, AhtOptions::default()).expect("open");
        for i in 0..n {
            t.append(alh(i)).expect("append");
        }
        t
    }

    #[test]
    fn inclusion_proofs_verify_for_every_leaf_and_size() {
        let dir = TempDir::new().expect("tempdir");
        let t = tree_with(dir.path(), 13);
        for n in 1..=13u64 {
            let root = t.root_at(n).expect("root");
            for i in 1..=n {
                let path = t.inclusion_proof(i, n).expect("proof");
                assert!(
                    verify_inclusion(&path, i - 1, n, alh_leaf(&alh(i - 1)), root),
                    "leaf {i} size {n}"
                );
            }
        }
    }

    #[test]
    fn consistency_proofs_verify_between_all_sizes() {
        let dir = TempDir::new().expect("tempdir");
        let t = tree_with(dir.path(), 13);
        for m in 1..=13u64 {
            for n in m..=13u64 {
                let path = t.consistency_proof(m, n).expect("proof");
                assert!(
                    verify_consistency(
                        &path,
                        m,
                        n,
                        t.root_at(m).expect("old root"),
                        t.root_at(n).expect("new root"),
                    ),
                    "sizes {m} -> {n}"
                );
            }
        }
    }

    #[test]
    fn reopen_rebuilds_same_root() {
        let dir = TempDir::new().expect("tempdir");
        let root = {
            let t = tree_with(dir.path(), 9);
            let root = t.root().expect("root");
            t.sync().expect("sync");
            t.close().expect("close");
            root
        };
        let t = AHTree::open(dir.path(), AhtOptions::default()).expect("reopen");
        assert_eq!(t.size(), 9);
        assert_eq!(t.root().expect("root"), root);
    }

    #[test]
    fn reset_size_rolls_back_uncommitted_growth() {
        let dir = TempDir::new().expect("tempdir");
        let t = tree_with(dir.path(), 8);
        let root5 = t.root_at(5).expect("root");
        t.reset_size(5).expect("reset");
        assert_eq!(t.size(), 5);
        assert_eq!(t.root().expect("root"), root5);
        // regrow differently
        t.append(alh(100)).expect("append");
        assert_eq!(t.size(), 6);
    }

    #[test]
    fn tampered_consistency_fails() {
        let dir = TempDir::new().expect("tempdir");
        let t = tree_with(dir.path(), 10);
        let mut path = t.consistency_proof(4, 10).expect("proof");
        if let Some(first) = path.first_mut() {
            first[0] ^= 0x01;
        }
        assert!(!verify_consistency(
            &path,
            4,
            10,
            t.root_at(4).expect("root"),
            t.root_at(10).expect("root"),
        ));
    }
}
