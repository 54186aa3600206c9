//! Priority donation.
//!
//! When a thread blocks on a lock whose holder has lower effective priority,
//! it donates its priority to the holder, and the boost propagates up the
//! chain of locks the holder itself is waiting on. Each donation is tied to
//! the lock that carried it and is revoked when that lock is released.

use super::Tid;
use super::scheduler::Kernel;
use crate::sync::lock::LockId;

/// Chains longer than this stop propagating.
pub(crate) const DONATION_DEPTH: usize = 8;

/// One received donation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Donation {
    pub(crate) donor: Tid,
    pub(crate) priority: i32,
    pub(crate) lock: LockId,
}

/// Records `donor`'s effective priority on `holder`, then walks the wait-for
/// chain and re-donates at each hop until the chain ends, the donation stops
/// raising anyone, or the depth bound is hit.
pub(crate) fn donate(k: &mut Kernel, donor: Tid, holder: Tid, lock: LockId) {
    let amount = k.thread(donor).effective_priority;
    let mut donor = donor;
    let mut target = holder;
    let mut lock = lock;
    for _ in 0..DONATION_DEPTH {
        let Some(th) = k.threads.get_mut(&target) else {
            return;
        };
        th.donations.push(Donation {
            donor,
            priority: amount,
            lock,
        });
        if !refresh_effective(k, target) {
            // Everyone further up already runs at least this high.
            return;
        }
        log::trace!("{donor:?} donates {amount} to {target:?}");
        let Some(next_lock) = k.thread(target).waiting_on else {
            return;
        };
        let Some(&next_holder) = k.lock_holders.get(&next_lock) else {
            return;
        };
        donor = target;
        target = next_holder;
        lock = next_lock;
    }
}

/// Revokes every donation `tid` received through `lock`.
pub(crate) fn revoke(k: &mut Kernel, tid: Tid, lock: LockId) {
    let Some(th) = k.threads.get_mut(&tid) else {
        return;
    };
    th.donations.retain(|d| {
        if d.lock == lock {
            log::trace!("{tid:?} loses {} donated by {:?}", d.priority, d.donor);
            false
        } else {
            true
        }
    });
    refresh_effective(k, tid);
}

/// Recomputes `effective = max(base, donations)` and repositions the thread
/// in the ready set if the value changed. Returns whether it changed.
pub(crate) fn refresh_effective(k: &mut Kernel, tid: Tid) -> bool {
    let Some(th) = k.threads.get_mut(&tid) else {
        return false;
    };
    let effective = th
        .donations
        .iter()
        .map(|d| d.priority)
        .fold(th.base_priority, i32::max);
    if effective == th.effective_priority {
        return false;
    }
    th.effective_priority = effective;
    k.reposition(tid);
    true
}
