//! Condition variable.

use super::lock::Lock;
use super::semaphore::Semaphore;
use super::spinlock::SpinLock;
use crate::thread::Tid;
use crate::thread::scheduler::with_kernel;
use std::sync::Arc;

struct Waiter {
    tid: Tid,
    seq: u64,
    wake: Arc<Semaphore>,
}

/// A condition variable, always used together with a [`Lock`].
///
/// [`wait`] atomically releases the lock and blocks; [`signal`] wakes
/// exactly one waiter, the one with the highest effective priority at signal
/// time; [`broadcast`] wakes every thread that was waiting when it was
/// called and no thread that started waiting later. All three require the
/// caller to hold the lock.
///
/// [`wait`]: Self::wait
/// [`signal`]: Self::signal
/// [`broadcast`]: Self::broadcast
pub struct Condvar {
    waiters: SpinLock<Vec<Waiter>>,
}

impl Condvar {
    /// Creates a condition variable with no waiters.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(Vec::new()),
        }
    }

    /// Releases `lock`, blocks until signaled, then re-acquires `lock`.
    ///
    /// # Panics
    /// Panics if the calling thread does not hold `lock`.
    pub fn wait(&self, lock: &Lock) {
        assert!(
            lock.held_by_current(),
            "condition wait without holding the lock"
        );
        // Each waiter blocks on its own one-shot semaphore, so a signal
        // wakes exactly the thread it picked.
        let wake = Arc::new(Semaphore::new(0));
        {
            let mut waiters = self.waiters.lock();
            let (tid, seq) = with_kernel(|k| (k.current, k.next_seq()));
            waiters.push(Waiter {
                tid,
                seq,
                wake: wake.clone(),
            });
            waiters.unlock();
        }
        lock.release();
        wake.down();
        lock.acquire();
    }

    /// Wakes the highest-priority waiter, if any.
    ///
    /// # Panics
    /// Panics if the calling thread does not hold `lock`.
    pub fn signal(&self, lock: &Lock) {
        assert!(
            lock.held_by_current(),
            "condition signal without holding the lock"
        );
        let woken = {
            let mut waiters = self.waiters.lock();
            let picked = best_waiter(&waiters).map(|at| waiters.remove(at));
            waiters.unlock();
            picked
        };
        if let Some(waiter) = woken {
            waiter.wake.up();
        }
    }

    /// Wakes every thread waiting at the time of the call.
    ///
    /// # Panics
    /// Panics if the calling thread does not hold `lock`.
    pub fn broadcast(&self, lock: &Lock) {
        assert!(
            lock.held_by_current(),
            "condition broadcast without holding the lock"
        );
        let woken = {
            let mut waiters = self.waiters.lock();
            let drained: Vec<Waiter> = waiters.drain(..).collect();
            waiters.unlock();
            drained
        };
        for waiter in woken {
            waiter.wake.up();
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the waiter with the highest current effective priority; ties go
/// to the earliest enqueued.
fn best_waiter(waiters: &[Waiter]) -> Option<usize> {
    if waiters.is_empty() {
        return None;
    }
    with_kernel(|k| {
        let mut best = 0;
        let mut rank = (i32::MIN, u64::MAX);
        for (at, waiter) in waiters.iter().enumerate() {
            let priority = k
                .threads
                .get(&waiter.tid)
                .map_or(i32::MIN, |t| t.effective_priority);
            if priority > rank.0 || (priority == rank.0 && waiter.seq < rank.1) {
                best = at;
                rank = (priority, waiter.seq);
            }
        }
        Some(best)
    })
}
