//! Counting semaphore.

use super::spinlock::{SpinLock, WouldBlock};
use crate::thread::scheduler::with_kernel;
use crate::thread::{Current, ParkHandle};

/// A counting semaphore.
///
/// [`down`] consumes a unit, parking the caller while the count is zero;
/// [`up`] adds a unit or, if threads are waiting, hands it directly to the
/// waiter with the highest effective priority. Priority is read at wake
/// time, so donations received while waiting count; ties go to the thread
/// that has waited longest.
///
/// [`down`]: Self::down
/// [`up`]: Self::up
pub struct Semaphore {
    inner: SpinLock<Inner>,
}

struct Inner {
    value: usize,
    waiters: Vec<ParkHandle>,
}

impl Semaphore {
    /// Creates a semaphore holding `value` units.
    pub const fn new(value: usize) -> Self {
        Self {
            inner: SpinLock::new(Inner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Acquires a unit, blocking until one is available.
    pub fn down(&self) {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            inner.unlock();
            return;
        }
        // The waiter list entry and the block happen atomically: the closure
        // runs with the scheduler locked and releases the list afterwards.
        Current::park_with(move |handle| {
            let mut inner = inner;
            inner.waiters.push(handle);
            inner.unlock();
        });
    }

    /// Attempts to acquire a unit without blocking.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if no unit is available.
    pub fn try_down(&self) -> Result<(), WouldBlock> {
        let mut inner = self.inner.lock();
        if inner.value > 0 {
            inner.value -= 1;
            inner.unlock();
            Ok(())
        } else {
            inner.unlock();
            Err(WouldBlock)
        }
    }

    /// Releases one unit. If threads are waiting the unit goes to the best
    /// of them, which may preempt the caller.
    pub fn up(&self) {
        let mut inner = self.inner.lock();
        if inner.waiters.is_empty() {
            inner.value += 1;
            inner.unlock();
            return;
        }
        let at = best_waiter(&inner.waiters);
        let handle = inner.waiters.remove(at);
        inner.unlock();
        handle.unpark();
    }
}

/// Index of the waiter with the highest current effective priority; ties go
/// to the earliest parked.
fn best_waiter(waiters: &[ParkHandle]) -> usize {
    with_kernel(|k| {
        let mut best = 0;
        let mut rank = (i32::MIN, u64::MAX);
        for (at, waiter) in waiters.iter().enumerate() {
            let priority = k
                .threads
                .get(&waiter.tid())
                .map_or(i32::MIN, |t| t.effective_priority);
            if priority > rank.0 || (priority == rank.0 && waiter.seq() < rank.1) {
                best = at;
                rank = (priority, waiter.seq());
            }
        }
        best
    })
}
