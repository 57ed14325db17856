use std::sync::Arc;

use ledgerdb::{Options, Precondition, Store, StoreError, TxMode};
use tempfile::TempDir;

fn small_options() -> Options {
    Options {
        synced: false,
        max_active_transactions: 100,
        max_concurrency: 4,
        max_io_concurrency: 1,
        max_tx_entries: 8,
        max_key_len: 64,
        max_value_len: 128,
        file_size: 1 << 16,
        time_fn: Some(Arc::new(|| 1_700_000_000)),
        ..Default::default()
    }
}

fn set_one(store: &Store, key: &str, value: &str) -> anyhow::Result<u64> {
    let mut otx = store.new_tx(TxMode::WriteOnly)?;
    otx.set(key.as_bytes().to_vec(), value.as_bytes().to_vec())?;
    Ok(store.commit(otx, true)?.id)
}

#[test]
fn must_not_exist_guards_inserts() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    set_one(&store, "k", "v1")?;

    let mut otx = store.new_tx(TxMode::WriteOnly)?;
    otx.set(&b"k"[..], &b"v2"[..])?;
    otx.add_precondition(Precondition::KeyMustNotExist {
        key: bytes::Bytes::from_static(b"k"),
    });
    assert!(matches!(
        store.commit(otx, false),
        Err(StoreError::PreconditionFailed(_))
    ));
    assert_eq!(store.last_committed_tx_id(), 1);

    store.close()?;
    Ok(())
}

#[test]
fn must_exist_passes_once_key_is_present() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    let mut otx = store.new_tx(TxMode::WriteOnly)?;
    otx.set(&b"dependent"[..], &b"v"[..])?;
    otx.add_precondition(Precondition::KeyMustExist {
        key: bytes::Bytes::from_static(b"base"),
    });
    assert!(matches!(
        store.commit(otx, false),
        Err(StoreError::PreconditionFailed(_))
    ));

    set_one(&store, "base", "v")?;

    let mut otx = store.new_tx(TxMode::WriteOnly)?;
    otx.set(&b"dependent"[..], &b"v"[..])?;
    otx.add_precondition(Precondition::KeyMustExist {
        key: bytes::Bytes::from_static(b"base"),
    });
    store.commit(otx, false)?;

    store.close()?;
    Ok(())
}

#[test]
fn not_modified_after_detects_interleaved_writes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    let observed = set_one(&store, "k", "v1")?;
    set_one(&store, "k", "v2")?;

    let mut otx = store.new_tx(TxMode::WriteOnly)?;
    otx.set(&b"k"[..], &b"v3"[..])?;
    otx.add_precondition(Precondition::KeyNotModifiedAfterTx {
        key: bytes::Bytes::from_static(b"k"),
        tx_id: observed,
    });
    assert!(matches!(
        store.commit(otx, false),
        Err(StoreError::PreconditionFailed(_))
    ));

    store.close()?;
    Ok(())
}

#[test]
fn invalid_preconditions_are_rejected_upfront() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    let mut otx = store.new_tx(TxMode::WriteOnly)?;
    otx.set(&b"k"[..], &b"v"[..])?;
    otx.add_precondition(Precondition::KeyMustExist {
        key: bytes::Bytes::new(),
    });
    assert!(matches!(
        store.commit(otx, false),
        Err(StoreError::InvalidPrecondition(_))
    ));

    let mut otx = store.new_tx(TxMode::WriteOnly)?;
    otx.set(&b"k"[..], &b"v"[..])?;
    otx.add_precondition(Precondition::KeyNotModifiedAfterTx {
        key: bytes::Bytes::from_static(b"k"),
        tx_id: 0,
    });
    assert!(matches!(
        store.commit(otx, false),
        Err(StoreError::InvalidPrecondition(_))
    ));

    store.close()?;
    Ok(())
}

#[test]
fn read_write_conflict_is_detected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    set_one(&store, "k", "v1")?;

    let mut otx = store.new_tx(TxMode::ReadWrite)?;
    let observed = store.tx_get(&mut otx, b"k")?;
    assert_eq!(observed.tx, 1);
    otx.set(&b"k"[..], &b"mine"[..])?;

    // interleaved writer updates the same key
    set_one(&store, "k", "theirs")?;

    assert!(matches!(
        store.commit(otx, false),
        Err(StoreError::TxReadConflict)
    ));

    store.close()?;
    Ok(())
}

#[test]
fn unchanged_read_set_commits_cleanly() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    set_one(&store, "k", "v1")?;

    let mut otx = store.new_tx(TxMode::ReadWrite)?;
    store.tx_get(&mut otx, b"k")?;
    otx.set(&b"k2"[..], &b"v"[..])?;
    store.commit(otx, false)?;

    store.close()?;
    Ok(())
}

#[test]
fn read_set_is_bounded() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(
        dir.path(),
        Options {
            mvcc_read_set_limit: 2,
            ..small_options()
        },
    )?;

    set_one(&store, "a", "1")?;
    set_one(&store, "b", "2")?;
    set_one(&store, "c", "3")?;

    let mut otx = store.new_tx(TxMode::ReadWrite)?;
    store.tx_get(&mut otx, b"a")?;
    store.tx_get(&mut otx, b"b")?;
    assert!(matches!(
        store.tx_get(&mut otx, b"c"),
        Err(StoreError::MvccReadSetLimitExceeded)
    ));

    store.close()?;
    Ok(())
}
