use std::io::Write;
use std::sync::Arc;

use ledgerdb::{Options, Store, TxMode};
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

fn write_n(store: &Store, n: u64) -> anyhow::Result<()> {
    for i in 0..n {
        let mut otx = store.new_tx(TxMode::WriteOnly)?;
        otx.set(format!("key-{i}").into_bytes(), format!("val-{i}").into_bytes())?;
        store.commit(otx, false)?;
    }
    Ok(())
}

#[test]
fn reopen_preserves_chain_and_values() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let committed_alh = {
        let store = Store::open(dir.path(), small_options())?;
        write_n(&store, 10)?;
        let alh = store.committed_alh();
        store.close()?;
        alh
    };

    let store = Store::open(dir.path(), small_options())?;
    assert_eq!(store.last_committed_tx_id(), 10);
    assert_eq!(store.committed_alh(), committed_alh);
    assert_eq!(store.tree_size(), 10);

    store.wait_for_indexing_upto(10, None)?;
    let vref = store.get(b"key-7")?;
    assert_eq!(store.resolve(&vref)?, bytes::Bytes::from("val-7"));

    store.close()?;
    Ok(())
}

// Precommit 10 txs while the commit gate is shut, make the tx log durable,
// stop before any commit record exists: the reopened store finds all 10 in
// the tx log and the background syncer lifts the commit point.
#[test]
fn syncer_commits_recovered_precommitted_tail() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let store = Store::open(
            dir.path(),
            Options {
                use_external_commit_allowance: true,
                ..small_options()
            },
        )?;
        for i in 0..10u64 {
            let mut otx = store.new_tx(TxMode::WriteOnly)?;
            otx.set(format!("key-{i}").into_bytes(), &b"v"[..])?;
            store.precommit(otx)?;
        }
        assert_eq!(store.last_precommitted_tx_id(), 10);
        assert_eq!(store.last_committed_tx_id(), 0);
        store.sync()?;
        store.close()?;
    }

    let store = Store::open(
        dir.path(),
        Options {
            synced: true,
            ..small_options()
        },
    )?;
    assert_eq!(store.last_precommitted_tx_id(), 10);
    store.wait_for_tx(10, false, None)?;
    assert_eq!(store.last_committed_tx_id(), 10);

    store.close()?;
    Ok(())
}

#[test]
fn half_written_tx_log_tail_is_dropped() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let store = Store::open(dir.path(), small_options())?;
        write_n(&store, 3)?;
        store.close()?;
    }

    // simulate a torn tail write
    let tx_dir = dir.path().join("tx");
    let chunk = std::fs::read_dir(&tx_dir)?
        .map(|e| e.expect("dir entry").path())
        .max()
        .expect("tx chunk present");
    let mut f = std::fs::OpenOptions::new().append(true).open(chunk)?;
    f.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x00])?;
    f.sync_all()?;

    let store = Store::open(dir.path(), small_options())?;
    assert_eq!(store.last_committed_tx_id(), 3);
    assert_eq!(store.last_precommitted_tx_id(), 3);
    write_n(&store, 1)?;
    assert_eq!(store.last_committed_tx_id(), 4);

    store.close()?;
    Ok(())
}

#[test]
fn trailing_commit_log_fragment_is_truncated() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let store = Store::open(dir.path(), small_options())?;
        write_n(&store, 3)?;
        store.close()?;
    }

    let commit_dir = dir.path().join("commit");
    let chunk = std::fs::read_dir(&commit_dir)?
        .map(|e| e.expect("dir entry").path())
        .max()
        .expect("commit chunk present");
    let mut f = std::fs::OpenOptions::new().append(true).open(chunk)?;
    f.write_all(&[1, 2, 3, 4, 5])?;
    f.sync_all()?;

    let store = Store::open(dir.path(), small_options())?;
    // the fragment is not a full record, so the commit point is unchanged;
    // the tx log replay finds nothing extra either
    assert_eq!(store.last_committed_tx_id(), 3);
    assert_eq!(store.last_precommitted_tx_id(), 3);

    store.close()?;
    Ok(())
}

#[test]
fn discarded_precommits_can_be_rewritten() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(
        dir.path(),
        Options {
            use_external_commit_allowance: true,
            ..small_options()
        },
    )?;

    write_precommitted(&store, 3)?;
    assert_eq!(store.last_precommitted_tx_id(), 3);

    let discarded = store.discard_precommitted_txs_since(2)?;
    assert_eq!(discarded, 2);
    assert_eq!(store.last_precommitted_tx_id(), 1);
    assert_eq!(store.tree_size(), 1);

    // IDs 2..3 are reassigned to fresh txs
    write_precommitted(&store, 1)?;
    assert_eq!(store.last_precommitted_tx_id(), 2);

    store.allow_commit_upto(2)?;
    assert_eq!(store.last_committed_tx_id(), 2);

    store.close()?;
    Ok(())
}

fn write_precommitted(store: &Store, n: u64) -> anyhow::Result<()> {
    for i in 0..n {
        let mut otx = store.new_tx(TxMode::WriteOnly)?;
        otx.set(format!("pre-{i}-{}", store.last_precommitted_tx_id()).into_bytes(), &b"v"[..])?;
        store.precommit(otx)?;
    }
    Ok(())
}
