//! Transaction model and on-disk serialization.
//!
//! Serialized layout (version 1; version 0 uses a `u16` entry count and
//! carries no tx metadata):
//!
//! ```text
//!   u64 ID | u64 Ts | u64 BlTxID | 32 BlRoot | 32 PrevAlh
//! | u16 Version
//! | u16 MdLen | MdLen bytes metadata
//! | u32 NEntries
//! | { u16 KvMdLen | KvMdLen bytes | u16 KLen | KLen bytes key |
//!     u32 VLen | u64 VOff | 32 HValue } x NEntries
//! | 32 Alh
//! ```
//!
//! All integers big-endian. The accumulative hash chains transactions:
//! `Alh = SHA-256(ID || PrevAlh || innerHash)` where
//! `innerHash = SHA-256(Ts || Version || (MdLen||Md)? || NEntries || BlTxID
//! || BlRoot || Eh)`.

pub(crate) mod pool;

use std::collections::HashSet;

use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::htree::{leaf_digest, HTree};
use crate::{sha256, Digest};

pub const MAX_TX_METADATA_LEN: usize = 256;
pub const MAX_KV_METADATA_LEN: usize = 32;

/// Current tx header serialization version.
pub const MAX_TX_HEADER_VERSION: u16 = 1;

const DELETED_ATTR: u8 = 0;
const EXPIRES_AT_ATTR: u8 = 1;
const NON_INDEXABLE_ATTR: u8 = 2;

/// Per-entry metadata: logical deletion, expiration and indexing opt-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KVMetadata {
    deleted: bool,
    expires_at: Option<i64>,
    non_indexable: bool,
}

impl KVMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    pub fn with_expiration(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn as_non_indexable(mut self, non_indexable: bool) -> Self {
        self.non_indexable = non_indexable;
        self
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }

    pub fn non_indexable(&self) -> bool {
        self.non_indexable
    }

    pub fn expired_at(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(ts) if ts <= now)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bs = Vec::with_capacity(MAX_KV_METADATA_LEN);
        if self.deleted {
            bs.push(DELETED_ATTR);
        }
        if let Some(ts) = self.expires_at {
            bs.push(EXPIRES_AT_ATTR);
            bs.extend_from_slice(&(ts as u64).to_be_bytes());
        }
        if self.non_indexable {
            bs.push(NON_INDEXABLE_ATTR);
        }
        bs
    }

    pub fn from_bytes(bs: &[u8]) -> Result<Self> {
        if bs.len() > MAX_KV_METADATA_LEN {
            return Err(StoreError::CorruptedTxData("kv metadata too large"));
        }
        let mut md = Self::default();
        let mut i = 0;
        while i < bs.len() {
            match bs[i] {
                DELETED_ATTR => {
                    md.deleted = true;
                    i += 1;
                }
                EXPIRES_AT_ATTR => {
                    if bs.len() < i + 9 {
                        return Err(StoreError::CorruptedTxData("truncated kv metadata"));
                    }
                    let ts = u64::from_be_bytes(bs[i + 1..i + 9].try_into().expect("sized"));
                    md.expires_at = Some(ts as i64);
                    i += 9;
                }
                NON_INDEXABLE_ATTR => {
                    md.non_indexable = true;
                    i += 1;
                }
                _ => return Err(StoreError::CorruptedTxData("unknown kv metadata attribute")),
            }
        }
        Ok(md)
    }
}

/// Opaque per-transaction metadata (version 1 headers only).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxMetadata {
    raw: Bytes,
}

impl TxMetadata {
    pub fn from_bytes(raw: impl Into<Bytes>) -> Result<Self> {
        let raw = raw.into();
        if raw.len() > MAX_TX_METADATA_LEN {
            return Err(StoreError::IllegalArgument("tx metadata too large"));
        }
        Ok(Self { raw })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHeader {
    pub id: u64,
    pub ts: i64,
    pub bl_tx_id: u64,
    pub bl_root: Digest,
    pub prev_alh: Digest,
    pub version: u16,
    pub metadata: Option<TxMetadata>,
    pub nentries: u32,
    pub eh: Digest,
}

impl Default for TxHeader {
    fn default() -> Self {
        Self {
            id: 0,
            ts: 0,
            bl_tx_id: 0,
            bl_root: [0u8; 32],
            prev_alh: [0u8; 32],
            version: 0,
            metadata: None,
            nentries: 0,
            eh: [0u8; 32],
        }
    }
}

impl TxHeader {
    pub(crate) fn inner_hash(&self) -> Digest {
        let mut bs = Vec::with_capacity(8 + 2 + 2 + MAX_TX_METADATA_LEN + 4 + 8 + 32 + 32);
        bs.extend_from_slice(&(self.ts as u64).to_be_bytes());
        bs.extend_from_slice(&self.version.to_be_bytes());
        match self.version {
            0 => {
                bs.extend_from_slice(&(self.nentries as u16).to_be_bytes());
            }
            1 => {
                let md = self.metadata.as_ref().map(|m| m.bytes()).unwrap_or(&[]);
                bs.extend_from_slice(&(md.len() as u16).to_be_bytes());
                bs.extend_from_slice(md);
                bs.extend_from_slice(&self.nentries.to_be_bytes());
            }
            v => panic!("missing tx serialization method for version {v}"),
        }
        bs.extend_from_slice(&self.bl_tx_id.to_be_bytes());
        bs.extend_from_slice(&self.bl_root);
        bs.extend_from_slice(&self.eh);
        sha256(&[&bs])
    }

    /// Accumulative linking hash: `SHA-256(ID || PrevAlh || innerHash)`.
    pub fn alh(&self) -> Digest {
        sha256(&[
            &self.id.to_be_bytes(),
            &self.prev_alh,
            &self.inner_hash(),
        ])
    }

    /// Self-contained header serialization, used by tx export.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bs = Vec::with_capacity(128);
        bs.extend_from_slice(&self.id.to_be_bytes());
        bs.extend_from_slice(&(self.ts as u64).to_be_bytes());
        bs.extend_from_slice(&self.bl_tx_id.to_be_bytes());
        bs.extend_from_slice(&self.bl_root);
        bs.extend_from_slice(&self.prev_alh);
        bs.extend_from_slice(&self.version.to_be_bytes());
        match self.version {
            0 => bs.extend_from_slice(&(self.nentries as u16).to_be_bytes()),
            1 => {
                let md = self.metadata.as_ref().map(|m| m.bytes()).unwrap_or(&[]);
                bs.extend_from_slice(&(md.len() as u16).to_be_bytes());
                bs.extend_from_slice(md);
                bs.extend_from_slice(&self.nentries.to_be_bytes());
            }
            v => panic!("missing tx serialization method for version {v}"),
        }
        bs.extend_from_slice(&self.eh);
        bs
    }

    pub fn read_from(bs: &[u8]) -> Result<Self> {
        let mut r = SliceReader::new(bs);
        let mut hdr = TxHeader {
            id: r.read_u64()?,
            ts: r.read_u64()? as i64,
            bl_tx_id: r.read_u64()?,
            ..TxHeader::default()
        };
        r.read_exact_bs(&mut hdr.bl_root)?;
        r.read_exact_bs(&mut hdr.prev_alh)?;
        hdr.version = r.read_u16()?;
        match hdr.version {
            0 => hdr.nentries = r.read_u16()? as u32,
            1 => {
                let md_len = r.read_u16()? as usize;
                if md_len > MAX_TX_METADATA_LEN {
                    return Err(StoreError::CorruptedTxData("tx metadata too large"));
                }
                if md_len > 0 {
                    let mut md = vec![0u8; md_len];
                    r.read_exact_bs(&mut md)?;
                    hdr.metadata = Some(TxMetadata::from_bytes(md)?);
                }
                hdr.nentries = r.read_u32()?;
            }
            v => return Err(StoreError::UnknownHeaderVersion(v)),
        }
        r.read_exact_bs(&mut hdr.eh)?;
        if !r.done() {
            return Err(StoreError::CorruptedTxData("trailing header bytes"));
        }
        Ok(hdr)
    }
}

#[derive(Debug, Clone)]
pub struct TxEntry {
    k: Vec<u8>,
    k_len: usize,
    md: Option<KVMetadata>,
    v_len: u32,
    v_off: u64,
    h_val: Digest,
}

impl TxEntry {
    pub(crate) fn preallocated(max_key_len: usize) -> Self {
        Self {
            k: vec![0u8; max_key_len],
            k_len: 0,
            md: None,
            v_len: 0,
            v_off: 0,
            h_val: [0u8; 32],
        }
    }

    pub(crate) fn set_key(&mut self, key: &[u8]) {
        self.k[..key.len()].copy_from_slice(key);
        self.k_len = key.len();
    }

    pub(crate) fn set_metadata(&mut self, md: Option<KVMetadata>) {
        self.md = md;
    }

    pub(crate) fn set_v_len(&mut self, v_len: u32) {
        self.v_len = v_len;
    }

    pub(crate) fn set_v_off(&mut self, v_off: u64) {
        self.v_off = v_off;
    }

    pub(crate) fn set_h_val(&mut self, h_val: Digest) {
        self.h_val = h_val;
    }

    pub fn key(&self) -> &[u8] {
        &self.k[..self.k_len]
    }

    pub fn metadata(&self) -> Option<&KVMetadata> {
        self.md.as_ref()
    }

    pub fn v_len(&self) -> u32 {
        self.v_len
    }

    pub fn v_off(&self) -> u64 {
        self.v_off
    }

    pub fn h_val(&self) -> Digest {
        self.h_val
    }

    /// Hash-tree leaf:
    /// `SHA-256(0x00 || mdLen||md || kLen||key || vLen || hValue)`.
    pub fn digest(&self) -> Digest {
        let md = self.md.as_ref().map(|m| m.to_bytes()).unwrap_or_default();
        let md_len = (md.len() as u16).to_be_bytes();
        let k_len = (self.k_len as u16).to_be_bytes();
        let v_len = self.v_len.to_be_bytes();
        leaf_digest(&[&md_len, &md, &k_len, self.key(), &v_len, &self.h_val])
    }
}

/// A transaction holder: header plus preallocated entry slots. Holders are
/// pooled and reused across commits.
#[derive(Debug)]
pub struct Tx {
    pub header: TxHeader,
    entries: Vec<TxEntry>,
}

impl Tx {
    pub(crate) fn new(max_tx_entries: usize, max_key_len: usize) -> Self {
        Self {
            header: TxHeader::default(),
            entries: (0..max_tx_entries)
                .map(|_| TxEntry::preallocated(max_key_len))
                .collect(),
        }
    }

    pub fn entries(&self) -> &[TxEntry] {
        &self.entries[..self.header.nentries as usize]
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [TxEntry] {
        let n = self.header.nentries as usize;
        &mut self.entries[..n]
    }

    /// Builds the per-tx hash tree and records its root as `Eh`. A tx with
    /// no entries (metadata-only) gets a zero `Eh`.
    pub fn build_hash_tree(&mut self) -> Result<()> {
        if self.header.nentries == 0 {
            self.header.eh = [0u8; 32];
            return Ok(());
        }
        let digests: Vec<Digest> = self.entries().iter().map(|e| e.digest()).collect();
        let tree = HTree::build_with(&digests)?;
        self.header.eh = tree.root();
        Ok(())
    }

    pub fn alh(&self) -> Digest {
        self.header.alh()
    }

    pub(crate) fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&self.header.id.to_be_bytes());
        buf.extend_from_slice(&(self.header.ts as u64).to_be_bytes());
        buf.extend_from_slice(&self.header.bl_tx_id.to_be_bytes());
        buf.extend_from_slice(&self.header.bl_root);
        buf.extend_from_slice(&self.header.prev_alh);
        buf.extend_from_slice(&self.header.version.to_be_bytes());
        match self.header.version {
            0 => buf.extend_from_slice(&(self.header.nentries as u16).to_be_bytes()),
            1 => {
                let md = self
                    .header
                    .metadata
                    .as_ref()
                    .map(|m| m.bytes())
                    .unwrap_or(&[]);
                buf.extend_from_slice(&(md.len() as u16).to_be_bytes());
                buf.extend_from_slice(md);
                buf.extend_from_slice(&self.header.nentries.to_be_bytes());
            }
            v => panic!("missing tx serialization method for version {v}"),
        }
        for e in self.entries() {
            let md = e.md.as_ref().map(|m| m.to_bytes()).unwrap_or_default();
            buf.extend_from_slice(&(md.len() as u16).to_be_bytes());
            buf.extend_from_slice(&md);
            buf.extend_from_slice(&(e.k_len as u16).to_be_bytes());
            buf.extend_from_slice(e.key());
            buf.extend_from_slice(&e.v_len.to_be_bytes());
            buf.extend_from_slice(&e.v_off.to_be_bytes());
            buf.extend_from_slice(&e.h_val);
        }
        buf.extend_from_slice(&self.header.alh());
    }

    /// Parses a serialized transaction. Unless `skip_integrity` is set, the
    /// stored Alh must match the one recomputed from the parsed content.
    pub(crate) fn read_from<R: TxDataRead>(&mut self, r: &mut R, skip_integrity: bool) -> Result<()> {
        self.header.id = r.read_u64()?;
        self.header.ts = r.read_u64()? as i64;
        self.header.bl_tx_id = r.read_u64()?;
        r.read_exact_bs(&mut self.header.bl_root)?;
        r.read_exact_bs(&mut self.header.prev_alh)?;
        self.header.version = r.read_u16()?;
        self.header.metadata = None;
        match self.header.version {
            0 => self.header.nentries = r.read_u16()? as u32,
            1 => {
                let md_len = r.read_u16()? as usize;
                if md_len > MAX_TX_METADATA_LEN {
                    return Err(StoreError::CorruptedTxData("tx metadata too large"));
                }
                if md_len > 0 {
                    let mut md = vec![0u8; md_len];
                    r.read_exact_bs(&mut md)?;
                    self.header.metadata = Some(TxMetadata::from_bytes(md)?);
                }
                self.header.nentries = r.read_u32()?;
            }
            v => return Err(StoreError::UnknownHeaderVersion(v)),
        }

        let nentries = self.header.nentries as usize;
        if nentries > self.entries.len() {
            return Err(StoreError::CorruptedTxData("max tx entries exceeded"));
        }

        let mut seen: HashSet<Vec<u8>> = HashSet::with_capacity(nentries);
        for i in 0..nentries {
            let md_len = r.read_u16()? as usize;
            if md_len > MAX_KV_METADATA_LEN {
                return Err(StoreError::CorruptedTxData("kv metadata too large"));
            }
            let md = if md_len > 0 {
                let mut bs = vec![0u8; md_len];
                r.read_exact_bs(&mut bs)?;
                Some(KVMetadata::from_bytes(&bs)?)
            } else {
                None
            };
            let k_len = r.read_u16()? as usize;
            let e = &mut self.entries[i];
            if k_len == 0 || k_len > e.k.len() {
                return Err(StoreError::CorruptedTxData("max key length exceeded"));
            }
            e.md = md;
            r.read_exact_bs(&mut e.k[..k_len])?;
            e.k_len = k_len;
            if !seen.insert(e.k[..k_len].to_vec()) {
                return Err(StoreError::CorruptedTxData("duplicate key in a single tx"));
            }
            e.v_len = r.read_u32()?;
            e.v_off = r.read_u64()?;
            r.read_exact_bs(&mut e.h_val)?;
        }

        self.build_hash_tree()?;

        let mut alh = [0u8; 32];
        r.read_exact_bs(&mut alh)?;
        if !skip_integrity && alh != self.header.alh() {
            return Err(StoreError::CorruptedTxData("accumulative hash mismatch"));
        }
        Ok(())
    }
}

/// Byte-source abstraction shared by log readers and in-memory slices.
pub(crate) trait TxDataRead {
    fn read_exact_bs(&mut self, buf: &mut [u8]) -> Result<()>;

    fn read_u16(&mut self) -> Result<u16> {
        let mut bs = [0u8; 2];
        self.read_exact_bs(&mut bs)?;
        Ok(u16::from_be_bytes(bs))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut bs = [0u8; 4];
        self.read_exact_bs(&mut bs)?;
        Ok(u32::from_be_bytes(bs))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut bs = [0u8; 8];
        self.read_exact_bs(&mut bs)?;
        Ok(u64::from_be_bytes(bs))
    }
}

impl TxDataRead for crate::appendable::Reader<'_> {
    fn read_exact_bs(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf)
    }
}

pub(crate) struct SliceReader<'a> {
    bs: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(bs: &'a [u8]) -> Self {
        Self { bs, pos: 0 }
    }

    pub fn done(&self) -> bool {
        self.pos == self.bs.len()
    }
}

impl TxDataRead for SliceReader<'_> {
    fn read_exact_bs(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.bs.len() - self.pos < buf.len() {
            return Err(StoreError::UnexpectedEof);
        }
        buf.copy_from_slice(&self.bs[self.pos..self.pos + buf.len()]);
        self.pos += buf.len();
        Ok(())
    }
}
