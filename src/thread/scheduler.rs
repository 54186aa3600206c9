//! Scheduler state and context switching.
//!
//! All scheduler state lives in a single [`Kernel`] value behind one global
//! [`SpinLock`]. At most one kernel thread executes at a time: every thread
//! owns a [`Gate`], and a context switch opens the successor's gate before
//! waiting on one's own. Because ticks are delivered synchronously by the
//! running thread, holding the kernel lock is a true critical section with
//! respect to the timer.
//!
//! The ready set is ordered by (effective priority descending, becoming-ready
//! sequence ascending): the front is always the highest-priority thread, and
//! threads of equal priority run in FIFO order. When the ready set is empty
//! but sleepers exist, [`idle`] plays the idle thread and fast-forwards the
//! tick counter to the next wake-up. An empty ready set with no sleepers
//! while the current thread blocks is a system deadlock and panics.

use super::mlfqs;
use super::{ExitState, Thread, ThreadState, Tid};
use crate::PRI_DEFAULT;
use crate::fixed::Fixed;
use crate::sync::lock::LockId;
use crate::sync::spinlock::{SpinLock, SpinLockGuard};
use crate::timer::TIMER_FREQ;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar as OsCondvar, Mutex as OsMutex};

/// Scheduling quantum in ticks. A thread that runs this long is sent to the
/// back of its priority band, and MLFQS recomputes priorities on the same
/// period.
pub(crate) const TIME_SLICE: i64 = 4;

pub(crate) static KERNEL: SpinLock<Option<Kernel>> = SpinLock::new(None);

/// Serializes kernel sessions process-wide so parallel tests cannot overlap.
static BOOT_LOCK: OsMutex<()> = OsMutex::new(());

/// A per-thread handoff gate backed by the host. Opening the gate lets the
/// owning thread run; the owner waits on it whenever it is switched out.
pub(crate) struct Gate {
    open: OsMutex<bool>,
    cond: OsCondvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            open: OsMutex::new(false),
            cond: OsCondvar::new(),
        }
    }

    pub(crate) fn open(&self) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        *open = true;
        self.cond.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        while !*open {
            open = self.cond.wait(open).unwrap_or_else(|e| e.into_inner());
        }
        *open = false;
    }
}

/// Position of a thread in the ready set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadyKey {
    pub(crate) priority: i32,
    pub(crate) seq: u64,
    pub(crate) tid: Tid,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // Highest priority first, then FIFO within a band.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.tid.cmp(&other.tid))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The whole scheduler state.
pub(crate) struct Kernel {
    /// Arena owning every control block; all cross-thread relations are ids.
    pub(crate) threads: BTreeMap<Tid, Thread>,
    ready: BTreeSet<ReadyKey>,
    /// Sleeping threads keyed by wake-up tick.
    pub(crate) sleepers: BTreeSet<(i64, Tid)>,
    /// Which thread holds which lock.
    pub(crate) lock_holders: BTreeMap<LockId, Tid>,
    pub(crate) current: Tid,
    pub(crate) ticks: i64,
    pub(crate) load_avg: Fixed,
    pub(crate) mlfqs: bool,
    /// Nesting depth of interrupt guards; preemption is deferred while > 0.
    pub(crate) preempt_depth: u32,
    /// A preemption became due while deferred.
    pub(crate) preempt_pending: bool,
    next_tid: u64,
    seq: u64,
    /// Ticks the current thread has run since it was scheduled.
    slice: i64,
}

impl Kernel {
    fn new(mlfqs: bool, mut main: Thread) -> Self {
        main.state = ThreadState::Running;
        let current = main.tid;
        let mut threads = BTreeMap::new();
        threads.insert(current, main);
        Self {
            threads,
            ready: BTreeSet::new(),
            sleepers: BTreeSet::new(),
            lock_holders: BTreeMap::new(),
            current,
            ticks: 0,
            load_avg: Fixed::ZERO,
            mlfqs,
            preempt_depth: 0,
            preempt_pending: false,
            next_tid: 1,
            seq: 0,
            slice: 0,
        }
    }

    pub(crate) fn alloc_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid += 1;
        tid
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Looks up a live control block, verifying its sentinel.
    pub(crate) fn thread(&self, tid: Tid) -> &Thread {
        let th = self.threads.get(&tid).expect("no control block for tid");
        th.check_magic();
        th
    }

    pub(crate) fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        let th = self.threads.get_mut(&tid).expect("no control block for tid");
        th.check_magic();
        th
    }

    pub(crate) fn current_thread(&mut self) -> &mut Thread {
        let current = self.current;
        self.thread_mut(current)
    }

    /// Marks `tid` runnable and queues it behind its priority band.
    pub(crate) fn insert_ready(&mut self, tid: Tid) {
        let seq = self.next_seq();
        let th = self.thread_mut(tid);
        th.state = ThreadState::Ready;
        let key = ReadyKey {
            priority: th.effective_priority,
            seq,
            tid,
        };
        th.ready_key = Some(key);
        self.ready.insert(key);
    }

    pub(crate) fn take_best_ready(&mut self) -> Option<Tid> {
        let key = self.ready.pop_first()?;
        self.thread_mut(key.tid).ready_key = None;
        Some(key.tid)
    }

    /// Takes the best ready thread other than `skip`. Used by teardown,
    /// which hands the CPU around regardless of priority.
    pub(crate) fn take_ready_excluding(&mut self, skip: Tid) -> Option<Tid> {
        let key = self.ready.iter().find(|k| k.tid != skip).copied()?;
        self.ready.remove(&key);
        self.thread_mut(key.tid).ready_key = None;
        Some(key.tid)
    }

    /// Re-keys a queued thread after its effective priority changed; keeps
    /// its position within the new band.
    pub(crate) fn reposition(&mut self, tid: Tid) {
        let Some(th) = self.threads.get(&tid) else {
            return;
        };
        let Some(key) = th.ready_key else {
            return;
        };
        let priority = th.effective_priority;
        if key.priority == priority {
            return;
        }
        self.ready.remove(&key);
        let key = ReadyKey { priority, ..key };
        self.thread_mut(tid).ready_key = Some(key);
        self.ready.insert(key);
    }

    pub(crate) fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// True when a ready thread outranks the running one.
    pub(crate) fn preemption_due(&self) -> bool {
        let Some(best) = self.ready.first().map(|k| k.priority) else {
            return false;
        };
        match self.threads.get(&self.current) {
            Some(cur) if cur.state == ThreadState::Running => best > cur.effective_priority,
            _ => false,
        }
    }
}

pub(crate) fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let mut guard = KERNEL.lock();
    let r = f(guard.as_mut().expect("kernel is not running"));
    guard.unlock();
    r
}

/// Boots the kernel, adopts the calling thread as `main`, runs `f`, drains
/// whatever is still alive, and tears everything down.
pub(crate) fn boot<R>(mlfqs: bool, f: impl FnOnce() -> R) -> R {
    let _session = BOOT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    super::install_exit_filter();
    let main = Thread::new(
        Tid(0),
        "main".into(),
        PRI_DEFAULT,
        0,
        Arc::new(Gate::new()),
        Arc::new(ExitState::new()),
    );
    {
        let mut guard = KERNEL.lock();
        assert!(guard.is_none(), "kernel is already running");
        *guard = Some(Kernel::new(mlfqs, main));
        guard.unlock();
    }
    log::debug!("boot (mlfqs = {mlfqs})");
    let _teardown = Teardown;
    let result = f();
    drain();
    result
}

/// Clears the kernel on every exit path, including a panicking main closure.
struct Teardown;

impl Drop for Teardown {
    fn drop(&mut self) {
        let mut guard = KERNEL.lock();
        *guard = None;
        guard.unlock();
        log::debug!("shutdown");
    }
}

/// Runs every remaining thread to completion. Priority no longer matters:
/// each pass hands the CPU to some other runnable thread so low-priority
/// stragglers can finish. Blocked threads that nothing will ever wake are a
/// fatal error.
fn drain() {
    loop {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().expect("kernel is not running");
        if k.threads.len() == 1 {
            guard.unlock();
            return;
        }
        let me = k.current;
        if let Some(next) = k.take_ready_excluding(me) {
            k.insert_ready(me);
            do_switch(guard, me, next);
        } else if !k.sleepers.is_empty() {
            idle(k);
            guard.unlock();
        } else {
            let leaked = k.threads.len() - 1;
            panic!("shutdown with {leaked} thread(s) still blocked");
        }
    }
}

/// Picks the next thread and switches to it. The caller must already have
/// moved the current thread wherever it belongs (ready set, sleep set, a
/// waiter list, or out of the arena entirely) and set its state.
pub(crate) fn switch_out(mut guard: SpinLockGuard<'_, Option<Kernel>>) {
    let k = guard.as_mut().expect("kernel is not running");
    let prev = k.current;
    let next = loop {
        match k.take_best_ready() {
            Some(tid) => break tid,
            None => idle(k),
        }
    };
    if next == prev {
        // The yielding thread is still the best choice.
        k.thread_mut(prev).state = ThreadState::Running;
        k.slice = 0;
        guard.unlock();
        return;
    }
    do_switch(guard, prev, next);
}

/// Transfers the CPU from `prev` to `next`. `next` must already be out of
/// the ready set. Consumes the kernel guard: the lock must never be held
/// while waiting on a gate.
pub(crate) fn do_switch(mut guard: SpinLockGuard<'_, Option<Kernel>>, prev: Tid, next: Tid) {
    let k = guard.as_mut().expect("kernel is not running");
    assert_eq!(
        k.preempt_depth, 0,
        "context switch while preemption is disabled"
    );
    k.current = next;
    k.slice = 0;
    let th = k.thread_mut(next);
    th.state = ThreadState::Running;
    let open_gate = th.gate.clone();
    // A thread that removed itself from the arena (exit) has no gate left to
    // wait on; its host thread simply returns.
    let wait_gate = k.threads.get(&prev).map(|t| t.gate.clone());
    log::trace!("switch {prev:?} -> {next:?}");
    guard.unlock();
    open_gate.open();
    if let Some(gate) = wait_gate {
        gate.wait();
    }
}

/// The idle thread: nothing is runnable, so time jumps to the next wake-up.
fn idle(k: &mut Kernel) {
    let Some(&(wake, _)) = k.sleepers.first() else {
        panic!("deadlock: every thread is blocked");
    };
    log::trace!("idle until tick {wake}");
    while k.ticks < wake {
        k.ticks += 1;
        tick_bookkeeping(k);
    }
}

/// Per-tick work: MLFQS accounting, waking due sleepers, and the periodic
/// recomputations. The caller has already advanced `k.ticks`.
fn tick_bookkeeping(k: &mut Kernel) {
    let current = k.current;
    if k.mlfqs {
        if let Some(th) = k.threads.get_mut(&current) {
            if th.state == ThreadState::Running {
                th.recent_cpu = th.recent_cpu.add_int(1);
            }
        }
    }
    while let Some(&(wake, tid)) = k.sleepers.first() {
        if wake > k.ticks {
            break;
        }
        k.sleepers.remove(&(wake, tid));
        k.insert_ready(tid);
    }
    if k.mlfqs {
        if k.ticks % TIMER_FREQ == 0 {
            mlfqs::recompute_load_avg(k);
            mlfqs::recompute_recent_cpu(k);
        }
        if k.ticks % TIME_SLICE == 0 {
            mlfqs::recompute_priorities(k);
        }
    }
}

/// Delivers one timer tick on behalf of the running thread.
pub(crate) fn timer_tick() {
    let fire = {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().expect("kernel is not running");
        k.ticks += 1;
        k.slice += 1;
        tick_bookkeeping(k);
        let mut fire = k.preemption_due();
        if k.slice >= TIME_SLICE && k.ready_count() > 0 {
            // Quantum used up: rotate within the band.
            fire = true;
        }
        if fire && k.preempt_depth > 0 {
            k.preempt_pending = true;
            fire = false;
        }
        guard.unlock();
        fire
    };
    if fire {
        super::yield_now();
    }
}

/// Blocks the calling thread until the tick counter reaches `wake_tick`.
pub(crate) fn sleep_until(wake_tick: i64) {
    let mut guard = KERNEL.lock();
    let k = guard.as_mut().expect("kernel is not running");
    if wake_tick <= k.ticks {
        guard.unlock();
        return;
    }
    let me = k.current;
    k.thread_mut(me).state = ThreadState::Blocked;
    k.sleepers.insert((wake_tick, me));
    log::trace!("{me:?} sleeps until tick {wake_tick}");
    switch_out(guard);
}

/// Yields if a ready thread outranks the caller, honoring deferral.
pub(crate) fn maybe_preempt() {
    let fire = {
        let mut guard = KERNEL.lock();
        let Some(k) = guard.as_mut() else {
            guard.unlock();
            return;
        };
        let mut fire = k.preemption_due();
        if fire && k.preempt_depth > 0 {
            k.preempt_pending = true;
            fire = false;
        }
        guard.unlock();
        fire
    };
    if fire {
        super::yield_now();
    }
}
