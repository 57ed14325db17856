//! Monotonic progress watchers.
//!
//! A [`WatchersHub`] tracks a single monotone "done up to N" watermark.
//! Waiters block until the watermark reaches their target, bounded by a
//! maximum number of concurrent waiters. Closing a hub unblocks everything
//! with `AlreadyClosed`; a cancelled [`Cancellation`] token surfaces
//! `Cancelled` to its waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StoreError};

/// Shared cancellation token for blocking waits.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// Cancelled waiters are not woken directly; they re-check the token on this
// cadence. Watermark advances and hub closure wake them immediately.
const CANCEL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct WatchersHub {
    state: Mutex<HubState>,
    cond: Condvar,
    max_waitees: usize,
}

#[derive(Debug)]
struct HubState {
    done_upto: u64,
    waitees: usize,
    closed: bool,
}

impl WatchersHub {
    pub fn new(done_upto: u64, max_waitees: usize) -> Self {
        Self {
            state: Mutex::new(HubState {
                done_upto,
                waitees: 0,
                closed: false,
            }),
            cond: Condvar::new(),
            max_waitees,
        }
    }

    /// Advances the watermark. Regressions are ignored: the watermark is
    /// monotone.
    pub fn done_upto(&self, t: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }
        if t > state.done_upto {
            state.done_upto = t;
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Blocks until the watermark reaches `t`.
    pub fn wait_for(&self, t: u64, cancel: Option<&Cancellation>) -> Result<()> {
        let mut state = self.state.lock();
        if state.done_upto >= t {
            return Ok(());
        }
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }
        if state.waitees == self.max_waitees {
            return Err(StoreError::MaxWaiteesLimitExceeded);
        }
        state.waitees += 1;

        let outcome = loop {
            if state.done_upto >= t {
                break Ok(());
            }
            if state.closed {
                break Err(StoreError::AlreadyClosed);
            }
            match cancel {
                Some(token) => {
                    if token.is_cancelled() {
                        break Err(StoreError::Cancelled);
                    }
                    let _ = self.cond.wait_for(&mut state, CANCEL_POLL);
                }
                None => self.cond.wait(&mut state),
            }
        };

        state.waitees -= 1;
        outcome
    }

    /// Current watermark and number of blocked waiters.
    pub fn status(&self) -> Result<(u64, usize)> {
        let state = self.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }
        Ok((state.done_upto, state.waitees))
    }

    /// Unblocks every waiter with `AlreadyClosed`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StoreError::AlreadyClosed);
        }
        state.closed = true;
        self.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn waiters_unblock_when_watermark_reaches_target() {
        let hub = Arc::new(WatchersHub::new(0, 4));
        let h = {
            let hub = hub.clone();
            thread::spawn(move || hub.wait_for(3, None))
        };
        thread::sleep(Duration::from_millis(20));
        hub.done_upto(2).expect("done");
        thread::sleep(Duration::from_millis(20));
        hub.done_upto(3).expect("done");
        h.join().expect("join").expect("wait");
        assert_eq!(hub.status().expect("status"), (3, 0));
    }

    #[test]
    fn watermark_is_monotone() {
        let hub = WatchersHub::new(5, 1);
        hub.done_upto(3).expect("regression ignored");
        assert_eq!(hub.status().expect("status").0, 5);
    }

    #[test]
    fn close_unblocks_with_already_closed() {
        let hub = Arc::new(WatchersHub::new(0, 4));
        let h = {
            let hub = hub.clone();
            thread::spawn(move || hub.wait_for(10, None))
        };
        thread::sleep(Duration::from_millis(20));
        hub.close().expect("close");
        assert!(matches!(
            h.join().expect("join"),
            Err(StoreError::AlreadyClosed)
        ));
    }

    #[test]
    fn cancellation_surfaces_cancelled() {
        let hub = Arc::new(WatchersHub::new(0, 4));
        let token = Cancellation::new();
        let h = {
            let hub = hub.clone();
            let token = token.clone();
            thread::spawn(move || hub.wait_for(10, Some(&token)))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(matches!(h.join().expect("join"), Err(StoreError::Cancelled)));
    }

    #[test]
    fn waitee_cap_is_enforced() {
        let hub = Arc::new(WatchersHub::new(0, 1));
        let blocked = {
            let hub = hub.clone();
            thread::spawn(move || hub.wait_for(1, None))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            hub.wait_for(1, None),
            Err(StoreError::MaxWaiteesLimitExceeded)
        ));
        hub.done_upto(1).expect("done");
        blocked.join().expect("join").expect("wait");
    }
}
