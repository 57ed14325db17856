use std::collections::HashSet;
use std::sync::Arc;

use ledgerdb::{Options, Store, TxMode};
use tempfile::TempDir;

fn concurrent_options() -> Options {
    Options {
        synced: false,
        max_active_transactions: 200,
        max_concurrency: 8,
        max_io_concurrency: 4,
        max_tx_entries: 8,
        max_key_len: 64,
        max_value_len: 256,
        file_size: 1 << 16,
        time_fn: Some(Arc::new(|| 1_700_000_000)),
        ..Default::default()
    }
}

#[test]
fn concurrent_writers_produce_a_dense_linked_chain() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), concurrent_options())?;

    const WRITERS: usize = 8;
    const PER_WRITER: usize = 25;

    std::thread::scope(|s| {
        for w in 0..WRITERS {
            let store = store.clone();
            s.spawn(move || {
                for i in 0..PER_WRITER {
                    let mut otx = store.new_tx(TxMode::WriteOnly).expect("new tx");
                    otx.set(
                        format!("w{w}-k{i}").into_bytes(),
                        format!("w{w}-v{i}").into_bytes(),
                    )
                    .expect("set");
                    store.commit(otx, false).expect("commit");
                }
            });
        }
    });

    let total = (WRITERS * PER_WRITER) as u64;
    assert_eq!(store.last_committed_tx_id(), total);
    assert_eq!(store.tree_size(), total);

    // IDs are dense and every header links to its predecessor
    let mut prev = store.read_tx_header(1, false, false)?;
    assert_eq!(prev.id, 1);
    for i in 2..=total {
        let header = store.read_tx_header(i, false, false)?;
        assert_eq!(header.id, i);
        assert_eq!(header.prev_alh, prev.alh());
        prev = header;
    }

    // every written key landed exactly once
    store.wait_for_indexing_upto(total, None)?;
    let mut seen = HashSet::new();
    for w in 0..WRITERS {
        for i in 0..PER_WRITER {
            let key = format!("w{w}-k{i}");
            let vref = store.get(key.as_bytes())?;
            assert!(seen.insert(key), "key indexed twice");
            assert_eq!(
                store.resolve(&vref)?,
                bytes::Bytes::from(format!("w{w}-v{i}"))
            );
        }
    }

    store.close()?;
    Ok(())
}

#[test]
fn synced_store_commits_are_durable_and_ordered() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(
        dir.path(),
        Options {
            synced: true,
            sync_frequency: std::time::Duration::from_millis(4),
            ..concurrent_options()
        },
    )?;

    std::thread::scope(|s| {
        for w in 0..4 {
            let store = store.clone();
            s.spawn(move || {
                for i in 0..10 {
                    let mut otx = store.new_tx(TxMode::WriteOnly).expect("new tx");
                    otx.set(format!("s{w}-{i}").into_bytes(), &b"v"[..]).expect("set");
                    store.commit(otx, false).expect("commit");
                }
            });
        }
    });

    assert_eq!(store.last_committed_tx_id(), 40);
    store.close()?;

    let store = Store::open(dir.path(), concurrent_options())?;
    assert_eq!(store.last_committed_tx_id(), 40);
    store.close()?;
    Ok(())
}

#[test]
fn closed_store_unblocks_waiters() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), concurrent_options())?;

    let waiter = {
        let store = store.clone();
        std::thread::spawn(move || store.wait_for_tx(100, false, None))
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    store.close()?;

    assert!(matches!(
        waiter.join().expect("join"),
        Err(ledgerdb::StoreError::AlreadyClosed)
    ));
    Ok(())
}

#[test]
fn cancellation_interrupts_blocked_waiters() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = Store::open(dir.path(), concurrent_options())?;

    let token = ledgerdb::Cancellation::new();
    let waiter = {
        let store = store.clone();
        let token = token.clone();
        std::thread::spawn(move || store.wait_for_tx(100, false, Some(&token)))
    };
    std::thread::sleep(std::time::Duration::from_millis(20));
    token.cancel();

    assert!(matches!(
        waiter.join().expect("join"),
        Err(ledgerdb::StoreError::Cancelled)
    ));
    store.close()?;
    Ok(())
}
