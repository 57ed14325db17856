//! In-memory ring buffer of precommitted commit-log records.
//!
//! Holds one record per precommitted-but-not-yet-committed transaction, in
//! ID order. The committer reads ahead without consuming; `advance_reader`
//! drops records whose commit-log entries were flushed and
//! `recede_writer` discards the newest records when the precommit tail is
//! rolled back.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::{Result, StoreError};
use crate::Digest;

#[derive(Debug, Clone, Copy)]
pub(crate) struct CLogEntry {
    pub tx_id: u64,
    pub alh: Digest,
    pub tx_off: u64,
    pub tx_size: u32,
}

pub(crate) struct PrecommitBuffer {
    state: Mutex<Ring>,
}

struct Ring {
    entries: VecDeque<CLogEntry>,
    capacity: usize,
}

impl PrecommitBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    pub fn put(&self, tx_id: u64, alh: Digest, tx_off: u64, tx_size: u32) -> Result<()> {
        let mut ring = self.state.lock();
        if ring.entries.len() == ring.capacity {
            return Err(StoreError::BufferFull);
        }
        ring.entries.push_back(CLogEntry {
            tx_id,
            alh,
            tx_off,
            tx_size,
        });
        Ok(())
    }

    /// Record `i` positions ahead of the reader, without consuming it.
    pub fn read_ahead(&self, i: usize) -> Result<CLogEntry> {
        let ring = self.state.lock();
        ring.entries
            .get(i)
            .copied()
            .ok_or(StoreError::IllegalArgument("read ahead past buffered tail"))
    }

    pub fn advance_reader(&self, n: usize) -> Result<()> {
        let mut ring = self.state.lock();
        if n > ring.entries.len() {
            return Err(StoreError::IllegalArgument("advance past buffered tail"));
        }
        ring.entries.drain(..n);
        Ok(())
    }

    /// Drops the `n` newest records (discarded precommits).
    pub fn recede_writer(&self, n: usize) -> Result<()> {
        let mut ring = self.state.lock();
        if n > ring.entries.len() {
            return Err(StoreError::IllegalArgument("recede past buffered head"));
        }
        for _ in 0..n {
            ring.entries.pop_back();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(i: u64) -> Digest {
        crate::sha256(&[&i.to_be_bytes()])
    }

    #[test]
    fn fifo_with_bounded_capacity() {
        let buf = PrecommitBuffer::new(2);
        buf.put(1, digest(1), 0, 10).expect("put");
        buf.put(2, digest(2), 10, 20).expect("put");
        assert!(matches!(
            buf.put(3, digest(3), 30, 5),
            Err(StoreError::BufferFull)
        ));

        assert_eq!(buf.read_ahead(0).expect("peek").tx_id, 1);
        assert_eq!(buf.read_ahead(1).expect("peek").tx_id, 2);

        buf.advance_reader(1).expect("advance");
        assert_eq!(buf.read_ahead(0).expect("peek").tx_id, 2);
        buf.put(3, digest(3), 30, 5).expect("slot freed");
    }

    #[test]
    fn recede_drops_newest_first() {
        let buf = PrecommitBuffer::new(4);
        for i in 1..=3u64 {
            buf.put(i, digest(i), i * 100, 10).expect("put");
        }
        buf.recede_writer(2).expect("recede");
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.read_ahead(0).expect("peek").tx_id, 1);
        assert!(buf.read_ahead(1).is_err());
    }
}
