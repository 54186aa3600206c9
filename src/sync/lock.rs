//! Mutual-exclusion lock with priority donation.

use super::semaphore::Semaphore;
use super::spinlock::WouldBlock;
use crate::thread::scheduler::{self, KERNEL, Kernel, with_kernel};
use crate::thread::{ThreadState, Tid, donation};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a [`Lock`], stable for its whole life. The kernel's holder
/// registry and all donation records refer to locks by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LockId(u64);

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(0);

/// A mutual-exclusion lock.
///
/// At most one thread holds the lock at a time and only the holder may
/// release it. While a higher-priority thread waits, the holder runs at the
/// waiter's effective priority, and the boost carries through chains of
/// locks (a waiter boosts the holder, which boosts whoever *it* waits on,
/// and so on). Under MLFQS no donation takes place.
///
/// # Panics
/// [`acquire`] panics if the holder re-acquires; [`release`] panics if the
/// caller is not the holder.
///
/// [`acquire`]: Self::acquire
/// [`release`]: Self::release
pub struct Lock {
    id: LockId,
    sem: Semaphore,
}

impl Lock {
    /// Creates a new open lock.
    pub fn new() -> Self {
        Self {
            id: LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed)),
            sem: Semaphore::new(1),
        }
    }

    /// Acquires the lock, blocking while it is held by another thread.
    pub fn acquire(&self) {
        let me = {
            let mut guard = KERNEL.lock();
            let k = guard.as_mut().expect("kernel is not running");
            let me = k.current;
            match k.lock_holders.get(&self.id).copied() {
                Some(holder) if holder == me => {
                    panic!("lock already held by the current thread")
                }
                Some(holder) => {
                    k.thread_mut(me).waiting_on = Some(self.id);
                    if !k.mlfqs {
                        donation::donate(k, me, holder, self.id);
                    }
                }
                None => {
                    k.thread_mut(me).waiting_on = Some(self.id);
                }
            }
            guard.unlock();
            me
        };
        self.sem.down();
        with_kernel(|k| {
            k.thread_mut(me).waiting_on = None;
            k.lock_holders.insert(self.id, me);
            adopt_waiting_donors(k, me, self.id);
        });
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if the lock is held.
    ///
    /// # Panics
    /// Panics if the calling thread already holds the lock.
    pub fn try_acquire(&self) -> Result<(), WouldBlock> {
        with_kernel(|k| {
            if k.lock_holders.get(&self.id) == Some(&k.current) {
                panic!("lock already held by the current thread");
            }
        });
        self.sem.try_down()?;
        with_kernel(|k| {
            let me = k.current;
            k.lock_holders.insert(self.id, me);
            adopt_waiting_donors(k, me, self.id);
        });
        Ok(())
    }

    /// Releases the lock, revoking the donations it carried and waking the
    /// best waiter.
    pub fn release(&self) {
        with_kernel(|k| {
            let me = k.current;
            match k.lock_holders.get(&self.id) {
                Some(&holder) if holder == me => {}
                _ => panic!("lock released by a thread that does not hold it"),
            }
            k.lock_holders.remove(&self.id);
            donation::revoke(k, me, self.id);
        });
        self.sem.up();
        // Losing a donation can leave the caller outranked even when no
        // waiter was woken.
        scheduler::maybe_preempt();
    }

    /// Whether the calling thread holds the lock.
    pub fn held_by_current(&self) -> bool {
        with_kernel(|k| k.lock_holders.get(&self.id) == Some(&k.current))
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs donation records from every thread still parked on this lock
/// onto its new holder.
///
/// A release hands the semaphore unit straight to the woken thread, so
/// between the release and the moment that thread registers itself the
/// holder registry has no entry for the lock. Threads that block in that
/// window find no holder to donate to, and donations from the remaining
/// waiters died with the previous holder's release. Both are recovered
/// here, when the new holder registers.
fn adopt_waiting_donors(k: &mut Kernel, holder: Tid, id: LockId) {
    if k.mlfqs {
        return;
    }
    let donors: Vec<Tid> = k
        .threads
        .values()
        .filter(|t| t.waiting_on == Some(id) && t.state == ThreadState::Blocked)
        .map(|t| t.tid)
        .collect();
    for donor in donors {
        donation::donate(k, donor, holder, id);
    }
}
