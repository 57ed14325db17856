use std::sync::Arc;

use ledgerdb::{empty_alh, EntrySpec, Options, Store, StoreError, TxMode};
use tempfile::TempDir;

fn small_options() -> Options {
    Options {
        synced: false,
        max_active_transactions: 100,
        max_concurrency: 4,
        max_io_concurrency: 2,
        max_tx_entries: 32,
        max_key_len: 64,
        max_value_len: 256,
        file_size: 1 << 16,
        time_fn: Some(Arc::new(|| 1_700_000_000)),
        ..Default::default()
    }
}

#[test]
fn single_tx_commit_and_read_back() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    let mut otx = store.new_write_only_tx()?;
    otx.set(&b"a"[..], &b"1"[..])?;
    let header = store.commit(otx, true)?;

    assert_eq!(store.last_committed_tx_id(), 1);
    assert_eq!(header.id, 1);
    assert_eq!(header.prev_alh, empty_alh());
    assert_eq!(header.bl_tx_id, 0);
    assert_eq!(header.ts, 1_700_000_000);

    let vref = store.get(b"a")?;
    assert_eq!(vref.tx, 1);
    assert_eq!(store.resolve(&vref)?, bytes::Bytes::from("1"));

    store.close()?;
    Ok(())
}

#[test]
fn linear_chain_links_every_header() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    for i in 0..100u32 {
        let mut otx = store.new_write_only_tx()?;
        otx.set(format!("key-{i}").into_bytes(), format!("val-{i}").into_bytes())?;
        store.commit(otx, false)?;
    }
    assert_eq!(store.last_committed_tx_id(), 100);
    assert_eq!(store.tree_size(), 100);

    let mut prev = store.read_tx_header(1, false, false)?;
    for i in 2..=100u64 {
        let header = store.read_tx_header(i, false, false)?;
        assert_eq!(header.prev_alh, prev.alh(), "broken linking at tx {i}");
        assert_eq!(header.bl_tx_id, i - 1);
        prev = header;
    }

    store.close()?;
    Ok(())
}

#[test]
fn duplicate_key_in_one_tx_is_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    let res = store.commit_with(
        |_tx_id, _index| {
            Ok((
                vec![
                    EntrySpec::new(&b"k"[..], &b"1"[..]),
                    EntrySpec::new(&b"k"[..], &b"2"[..]),
                ],
                vec![],
            ))
        },
        false,
    );
    assert!(matches!(res, Err(StoreError::DuplicatedKey)));
    assert_eq!(store.last_committed_tx_id(), 0);
    assert_eq!(store.last_precommitted_tx_id(), 0);

    store.close()?;
    Ok(())
}

#[test]
fn validation_limits_are_enforced() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    let otx = store.new_write_only_tx()?;
    assert!(matches!(
        store.commit(otx, false),
        Err(StoreError::NoEntriesProvided)
    ));

    let mut otx = store.new_write_only_tx()?;
    assert!(matches!(
        otx.set(bytes::Bytes::new(), &b"v"[..]),
        Err(StoreError::NullKey)
    ));

    let mut otx = store.new_write_only_tx()?;
    otx.set(vec![7u8; 65], &b"v"[..])?;
    assert!(matches!(
        store.commit(otx, false),
        Err(StoreError::MaxKeyLenExceeded)
    ));

    let mut otx = store.new_write_only_tx()?;
    otx.set(&b"k"[..], vec![7u8; 257])?;
    assert!(matches!(
        store.commit(otx, false),
        Err(StoreError::MaxValueLenExceeded)
    ));

    store.close()?;
    Ok(())
}

#[test]
fn deletion_hides_key_but_keeps_history() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    let mut otx = store.new_write_only_tx()?;
    otx.set(&b"k"[..], &b"v1"[..])?;
    store.commit(otx, true)?;

    let mut otx = store.new_write_only_tx()?;
    otx.delete(&b"k"[..])?;
    store.commit(otx, true)?;

    assert!(matches!(store.get(b"k"), Err(StoreError::KeyNotFound)));

    let (txs, total) = store.history(b"k", 0, false, 10)?;
    assert_eq!(total, 2);
    assert_eq!(txs, vec![1, 2]);
    let (txs, _) = store.history(b"k", 0, true, 1)?;
    assert_eq!(txs, vec![2]);

    store.close()?;
    Ok(())
}

#[test]
fn expired_entries_surface_as_expired() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    let mut otx = store.new_write_only_tx()?;
    otx.set_with_metadata(
        &b"ttl"[..],
        ledgerdb::KVMetadata::new().with_expiration(1_600_000_000),
        &b"v"[..],
    )?;
    store.commit(otx, true)?;

    assert!(matches!(store.get(b"ttl"), Err(StoreError::ExpiredEntry)));

    store.close()?;
    Ok(())
}

#[test]
fn prefix_lookup_skips_unrelated_and_seed_keys() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    for key in ["user:alice", "user:bob", "zone:1"] {
        let mut otx = store.new_write_only_tx()?;
        otx.set(key.as_bytes().to_vec(), &b"v"[..])?;
        store.commit(otx, true)?;
    }

    let (key, _) = store.get_with_prefix(b"user:", None)?;
    assert_eq!(&key[..], b"user:alice");
    let (key, _) = store.get_with_prefix(b"user:", Some(b"user:alice"))?;
    assert_eq!(&key[..], b"user:bob");
    assert!(matches!(
        store.get_with_prefix(b"nope:", None),
        Err(StoreError::KeyNotFound)
    ));

    store.close()?;
    Ok(())
}

#[test]
fn read_write_tx_observes_own_pending_writes() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_options())?;

    let mut otx = store.new_tx(TxMode::ReadWrite)?;
    otx.set(&b"k"[..], &b"pending"[..])?;
    let vref = store.tx_get(&mut otx, b"k")?;
    assert_eq!(vref.v_len, 7);
    store.commit(otx, true)?;

    store.close()?;
    Ok(())
}

#[test]
fn timestamp_binary_search_finds_boundaries() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let ts = Arc::new(std::sync::atomic::AtomicI64::new(100));
    let ts_for_store = ts.clone();
    let store = Store::open(
        dir.path(),
        Options {
            time_fn: Some(Arc::new(move || {
                ts_for_store.load(std::sync::atomic::Ordering::SeqCst)
            })),
            ..small_options()
        },
    )?;

    for i in 0..5u64 {
        ts.store(100 + i as i64 * 10, std::sync::atomic::Ordering::SeqCst);
        let mut otx = store.new_write_only_tx()?;
        otx.set(format!("k{i}").into_bytes(), &b"v"[..])?;
        store.commit(otx, false)?;
    }

    assert_eq!(store.first_tx_since(105)?.id, 2);
    assert_eq!(store.last_tx_until(125)?.id, 3);
    assert!(matches!(
        store.first_tx_since(1_000),
        Err(StoreError::TxNotFound)
    ));

    store.close()?;
    Ok(())
}
