//! Multi-level feedback queue scheduling.
//!
//! Priorities fall out of two exponentially weighted moving averages kept in
//! q17.14 fixed point: the system `load_avg` (runnable threads, recomputed
//! once a second) and each thread's `recent_cpu` (incremented every tick it
//! runs, decayed once a second by a factor derived from `load_avg`). Every
//! scheduling quantum, each thread's priority is rederived as
//! `PRI_MAX - recent_cpu/4 - 2*nice`, clamped to the valid range.

use super::scheduler::Kernel;
use super::{ThreadState, Tid};
use crate::fixed::Fixed;
use crate::{PRI_MAX, PRI_MIN};

/// `load_avg <- (59/60)*load_avg + (1/60)*ready_threads`, where the running
/// thread counts as ready but the idle thread does not.
pub(crate) fn recompute_load_avg(k: &mut Kernel) {
    let current = k.current;
    let running = k
        .threads
        .get(&current)
        .is_some_and(|t| t.state == ThreadState::Running);
    let ready = k.ready_count() as i32 + running as i32;
    let decay = Fixed::from_int(59) / Fixed::from_int(60);
    let gain = Fixed::ONE.div_int(60);
    k.load_avg = decay * k.load_avg + gain.mul_int(ready);
}

/// `recent_cpu <- (2*load_avg)/(2*load_avg + 1) * recent_cpu + nice` for
/// every thread, running or not.
pub(crate) fn recompute_recent_cpu(k: &mut Kernel) {
    let twice = k.load_avg.mul_int(2);
    let decay = twice / twice.add_int(1);
    for th in k.threads.values_mut() {
        th.recent_cpu = (decay * th.recent_cpu).add_int(th.nice);
    }
}

/// Rederives every thread's priority from its `recent_cpu` and `nice`.
pub(crate) fn recompute_priorities(k: &mut Kernel) {
    let tids: Vec<Tid> = k.threads.keys().copied().collect();
    for tid in tids {
        recompute_priority(k, tid);
    }
}

/// `priority <- clamp(PRI_MAX - recent_cpu/4 - 2*nice)`. The result becomes
/// both the base and the effective priority; donations play no part here.
pub(crate) fn recompute_priority(k: &mut Kernel, tid: Tid) {
    let Some(th) = k.threads.get_mut(&tid) else {
        return;
    };
    let raw =
        Fixed::from_int(PRI_MAX) - th.recent_cpu.div_int(4) - Fixed::from_int(2 * th.nice);
    let priority = raw.to_int().clamp(PRI_MIN, PRI_MAX);
    th.base_priority = priority;
    th.effective_priority = priority;
    k.reposition(tid);
}
