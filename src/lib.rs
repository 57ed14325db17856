//! `ledgerdb` is an immutable, append-only transactional key-value storage
//! engine with verifiable cryptographic linking.
//!
//! This crate is intentionally opinionated about correctness first:
//! - Transactions are never mutated or deleted once committed; only the
//!   not-yet-committed precommit tail may be discarded.
//! - Every transaction is linked to all prior ones twice: linearly through an
//!   accumulative hash (Alh) and binarily through an append-only Merkle tree
//!   over the Alh sequence.
//! - Durability follows a strict two-phase discipline: precommit (tx log +
//!   Merkle tree) then commit (commit-log record), with fsync ordering
//!   value logs -> tx log -> commit log in synced mode.
//! - Inclusion and consistency proofs can be produced between any pair of
//!   committed transactions and verified client-side.
//!
//! The key index is a collaborator behind the [`index::Indexer`] trait; a
//! process-local in-memory implementation is provided for embedding and
//! tests.

pub mod aht;
pub mod appendable;
pub mod error;
pub mod htree;
pub mod index;
pub mod store;
pub mod tx;
pub mod watchers;

pub use error::{Result, StoreError};
pub use index::{Filter, Indexer, KeyIndex, ValueRef};
pub use store::{
    DualProof, EntrySpec, LinearAdvanceProof, LinearProof, OngoingTx, Options, Precondition,
    Store, TxMode,
};
pub use tx::{KVMetadata, Tx, TxEntry, TxHeader, TxMetadata};
pub use watchers::{Cancellation, WatchersHub};

/// SHA-256 digest.
pub type Digest = [u8; 32];

pub(crate) fn sha256(chunks: &[&[u8]]) -> Digest {
    use sha2::{Digest as _, Sha256};
    let mut h = Sha256::new();
    for c in chunks {
        h.update(c);
    }
    h.finalize().into()
}

/// `Alh(0)`: the accumulative hash before any transaction exists.
pub fn empty_alh() -> Digest {
    sha256(&[])
}
