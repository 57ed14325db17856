//! Bounded pool of preallocated transaction holders.
//!
//! Holder buffers (entry slots + key scratch) are allocated once at open;
//! writers borrow a holder for the duration of a precommit and return it on
//! drop. An exhausted pool surfaces as a concurrency-limit error at the
//! engine boundary.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use super::Tx;

pub(crate) struct TxPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    free: Mutex<Vec<Box<Tx>>>,
    capacity: usize,
}

impl TxPool {
    pub fn new(pool_size: usize, max_tx_entries: usize, max_key_len: usize) -> Self {
        let free = (0..pool_size)
            .map(|_| Box::new(Tx::new(max_tx_entries, max_key_len)))
            .collect();
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                capacity: pool_size,
            }),
        }
    }

    /// Borrows a holder; `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<PooledTx> {
        let tx = self.shared.free.lock().pop()?;
        Some(PooledTx {
            tx: Some(tx),
            shared: self.shared.clone(),
        })
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.shared.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// RAII guard over a pooled [`Tx`]; returns the holder on drop.
pub(crate) struct PooledTx {
    tx: Option<Box<Tx>>,
    shared: Arc<PoolShared>,
}

impl Deref for PooledTx {
    type Target = Tx;

    fn deref(&self) -> &Tx {
        self.tx.as_deref().expect("holder present until drop")
    }
}

impl DerefMut for PooledTx {
    fn deref_mut(&mut self) -> &mut Tx {
        self.tx.as_deref_mut().expect("holder present until drop")
    }
}

impl Drop for PooledTx {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.shared.free.lock().push(tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_bounds_concurrent_holders() {
        let pool = TxPool::new(2, 4, 16);
        let a = pool.alloc().expect("first");
        let _b = pool.alloc().expect("second");
        assert!(pool.alloc().is_none());
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        let _c = pool.alloc().expect("released holder is reusable");
    }
}
