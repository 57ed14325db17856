use std::sync::Arc;

use ledgerdb::{Options, Store, StoreError, TxMode};
use tempfile::TempDir;

fn small_chunk_options() -> Options {
    Options {
        synced: false,
        max_active_transactions: 100,
        max_concurrency: 4,
        max_io_concurrency: 1,
        max_tx_entries: 8,
        max_key_len: 64,
        max_value_len: 2048,
        // small chunks so truncation actually reclaims files
        file_size: 4096,
        time_fn: Some(Arc::new(|| 1_700_000_000)),
        ..Default::default()
    }
}

fn write_big_values(store: &Store, n: u64) -> anyhow::Result<()> {
    for i in 0..n {
        let mut otx = store.new_tx(TxMode::WriteOnly)?;
        otx.set(format!("key-{i}").into_bytes(), vec![i as u8; 1024])?;
        store.commit(otx, false)?;
    }
    Ok(())
}

#[test]
fn truncation_reclaims_old_chunks_and_keeps_recent_values() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_chunk_options())?;

    write_big_values(&store, 20)?;
    store.truncate_upto_tx(18)?;

    // early values fall below the discard floor
    let (early, _) = {
        let tx = store.read_tx(1, false)?;
        (tx.entries()[0].clone(), ())
    };
    assert!(matches!(
        store.read_value(&early),
        Err(StoreError::OffsetOutOfRange)
    ));

    // values at and after the truncation point remain readable
    for tx_id in 18..=20u64 {
        let tx = store.read_tx(tx_id, false)?;
        let value = store.read_value(&tx.entries()[0])?;
        assert_eq!(value.len(), 1024);
        assert_eq!(value[0], (tx_id - 1) as u8);
    }

    store.close()?;
    Ok(())
}

#[test]
fn truncated_tx_exports_digests_instead_of_values() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_chunk_options())?;

    write_big_values(&store, 20)?;
    store.truncate_upto_tx(18)?;

    // all-or-none: a fully truncated tx exports value digests
    let exported = store.export_tx(1, false, false)?;
    assert_eq!(exported[exported.len() - 1], 1);

    // an untouched tx still ships its values
    let exported = store.export_tx(20, false, false)?;
    assert_eq!(exported[exported.len() - 1], 0);

    store.close()?;
    Ok(())
}

#[test]
fn truncated_export_replicates_without_values() -> anyhow::Result<()> {
    let a_dir = TempDir::new()?;
    let b_dir = TempDir::new()?;

    let primary = Store::open(a_dir.path(), small_chunk_options())?;
    write_big_values(&primary, 20)?;
    primary.truncate_upto_tx(18)?;

    let replica = Store::open(b_dir.path(), small_chunk_options())?;
    let exported = primary.export_tx(1, false, false)?;
    // integrity is relaxed: the entries tree cannot be recomputed without
    // the value bytes
    let header = replica.replicate_tx(&exported, true, false, None)?;
    assert_eq!(header.id, 1);

    // the replicated entry has no stored value to read
    let tx = replica.read_tx(1, true)?;
    assert_eq!(tx.entries()[0].v_off(), 0);

    primary.close()?;
    replica.close()?;
    Ok(())
}

#[test]
fn truncation_point_must_be_committed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), small_chunk_options())?;

    write_big_values(&store, 3)?;
    assert!(matches!(
        store.truncate_upto_tx(0),
        Err(StoreError::IllegalArgument(_))
    ));
    assert!(matches!(
        store.truncate_upto_tx(4),
        Err(StoreError::IllegalArgument(_))
    ));

    store.close()?;
    Ok(())
}
