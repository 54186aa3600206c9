//! Kernel threads.
//!
//! A thread is spawned through [`ThreadBuilder`], runs a closure under the
//! kernel scheduler, and reports an exit code through its [`JoinHandle`].
//! Exactly one thread runs at a time; the scheduler always runs the ready
//! thread with the highest *effective* priority, which is the thread's base
//! priority raised by any priority donations it is receiving.
//!
//! Blocking primitives park threads through [`Current::park_with`]: the
//! closure it takes runs after the thread is marked blocked but before the
//! switch, and stores the [`ParkHandle`] somewhere a waker will find it.
//! [`ParkHandle::unpark`] makes the thread runnable again and preempts the
//! caller if the woken thread outranks it.

pub(crate) mod donation;
pub(crate) mod mlfqs;
pub(crate) mod scheduler;

use crate::fixed::Fixed;
use crate::sync::Semaphore;
use crate::sync::lock::LockId;
use crate::{KernelError, PRI_DEFAULT, PRI_MAX, PRI_MIN};
use donation::Donation;
use scheduler::{Gate, KERNEL, ReadyKey, with_kernel};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Once};

/// Sentinel stamped into every control block. A mismatch means the block was
/// trampled and the kernel cannot continue.
pub(crate) const THREAD_MAGIC: u64 = 0xdead_beef_cafe_babe;

/// Stable identifier of a kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub(crate) u64);

impl Tid {
    /// The raw id value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Life-cycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Currently executing.
    Running,
    /// Runnable, queued in the ready set.
    Ready,
    /// Waiting for a wake-up (a primitive or the timer).
    Blocked,
    /// Tearing itself down.
    Dying,
}

/// A thread control block. Owned by the kernel arena; everything else refers
/// to it by [`Tid`].
pub(crate) struct Thread {
    pub(crate) tid: Tid,
    pub(crate) name: String,
    pub(crate) state: ThreadState,
    /// Priority set at spawn or via `set_priority` (recomputed under MLFQS).
    pub(crate) base_priority: i32,
    /// Cached `max(base_priority, received donations)`.
    pub(crate) effective_priority: i32,
    pub(crate) nice: i32,
    pub(crate) recent_cpu: Fixed,
    /// The lock this thread is blocked on, for transitive donation.
    pub(crate) waiting_on: Option<LockId>,
    pub(crate) donations: Vec<Donation>,
    /// Position in the ready set while queued there.
    pub(crate) ready_key: Option<ReadyKey>,
    pub(crate) gate: Arc<Gate>,
    pub(crate) exit: Arc<ExitState>,
    pub(crate) cleanup: Vec<Box<dyn FnOnce() + Send>>,
    magic: u64,
}

impl Thread {
    pub(crate) fn new(
        tid: Tid,
        name: String,
        priority: i32,
        nice: i32,
        gate: Arc<Gate>,
        exit: Arc<ExitState>,
    ) -> Self {
        Self {
            tid,
            name,
            state: ThreadState::Ready,
            base_priority: priority,
            effective_priority: priority,
            nice,
            recent_cpu: Fixed::ZERO,
            waiting_on: None,
            donations: Vec::new(),
            ready_key: None,
            gate,
            exit,
            cleanup: Vec::new(),
            magic: THREAD_MAGIC,
        }
    }

    pub(crate) fn check_magic(&self) {
        assert_eq!(self.magic, THREAD_MAGIC, "thread control block corrupted");
    }
}

/// Exit plumbing shared between a thread and its join handle: the exit code
/// and a semaphore upped exactly once when the thread dies.
pub(crate) struct ExitState {
    code: AtomicI32,
    done: Semaphore,
}

impl ExitState {
    pub(crate) fn new() -> Self {
        Self {
            code: AtomicI32::new(0),
            done: Semaphore::new(0),
        }
    }
}

/// Owned permission to wait for a thread's termination.
pub struct JoinHandle {
    tid: Tid,
    exit: Arc<ExitState>,
}

impl JoinHandle {
    /// The spawned thread's id.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Blocks until the thread exits and returns its exit code: 0 for a
    /// normal return, -1 if the body panicked, or the argument given to
    /// [`Current::exit`].
    pub fn join(self) -> i32 {
        self.exit.done.down();
        self.exit.code.load(Ordering::SeqCst)
    }
}

/// A handle to wake one parked thread, produced by [`Current::park_with`].
pub struct ParkHandle {
    tid: Tid,
    seq: u64,
}

impl ParkHandle {
    /// The parked thread.
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Parking order, for FIFO tie-breaking among equal-priority waiters.
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Makes the parked thread runnable again, preempting the caller if the
    /// woken thread outranks it.
    pub fn unpark(self) {
        let fire = {
            let mut guard = KERNEL.lock();
            let Some(k) = guard.as_mut() else {
                guard.unlock();
                return;
            };
            k.insert_ready(self.tid);
            let mut fire = k.preemption_due();
            if fire && k.preempt_depth > 0 {
                k.preempt_pending = true;
                fire = false;
            }
            guard.unlock();
            fire
        };
        if fire {
            yield_now();
        }
    }
}

/// Operations on the calling thread.
pub struct Current;

impl Current {
    /// The calling thread's id.
    pub fn tid() -> Tid {
        with_kernel(|k| k.current)
    }

    /// The calling thread's name.
    pub fn name() -> String {
        with_kernel(|k| k.current_thread().name.clone())
    }

    /// Parks the calling thread until someone calls [`ParkHandle::unpark`].
    ///
    /// `f` runs with the scheduler locked, after the thread is marked
    /// blocked but before the switch, so there is no window in which a wake
    /// can be lost. It must hand the [`ParkHandle`] to whoever will wake the
    /// thread. `f` must not block and must not touch the scheduler.
    ///
    /// # Panics
    /// Panics if called while preemption is disabled.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        let mut guard = KERNEL.lock();
        let k = guard.as_mut().expect("kernel is not running");
        assert_eq!(
            k.preempt_depth, 0,
            "parking while preemption is disabled"
        );
        let me = k.current;
        let seq = k.next_seq();
        k.thread_mut(me).state = ThreadState::Blocked;
        f(ParkHandle { tid: me, seq });
        scheduler::switch_out(guard);
    }

    /// Registers a hook that runs exactly once when the thread exits, on
    /// both the normal and the panicking path. Hooks run in registration
    /// order, before the joiner is woken.
    pub fn register_cleanup(f: impl FnOnce() + Send + 'static) {
        with_kernel(|k| k.current_thread().cleanup.push(Box::new(f)));
    }

    /// Terminates the calling thread with `code`.
    ///
    /// Must be called from a spawned thread, not from the main closure.
    pub fn exit(code: i32) -> ! {
        panic::panic_any(ThreadExit(code))
    }
}

/// Internal unwind payload carrying an explicit exit code to the trampoline.
struct ThreadExit(i32);

/// Keeps the host panic hook quiet about the exit payload. Installed once,
/// at first boot; every other panic goes to the previous hook untouched.
pub(crate) fn install_exit_filter() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ThreadExit>().is_none() {
                previous(info);
            }
        }));
    });
}

/// Builder for spawning a kernel thread.
///
/// ```
/// use kestrel::thread::ThreadBuilder;
///
/// kestrel::run(|| {
///     let handle = ThreadBuilder::new("worker")
///         .priority(40)
///         .spawn(|| {})
///         .unwrap();
///     assert_eq!(handle.join(), 0);
/// });
/// ```
pub struct ThreadBuilder {
    name: String,
    priority: i32,
}

impl ThreadBuilder {
    /// Starts a builder with [`PRI_DEFAULT`] priority.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: PRI_DEFAULT,
        }
    }

    /// Sets the initial base priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Spawns the thread and makes it runnable. The child inherits the
    /// creator's nice value and starts with zero recent CPU time. The
    /// creator is preempted at once if the child outranks it.
    ///
    /// # Errors
    /// [`KernelError::InvalidArgument`] for a priority outside
    /// `[PRI_MIN, PRI_MAX]`, [`KernelError::NotRunning`] outside a kernel
    /// session, [`KernelError::NoResource`] if the host cannot back the
    /// thread.
    pub fn spawn<F>(self, f: F) -> Result<JoinHandle, KernelError>
    where
        F: FnOnce() + Send + 'static,
    {
        let Self { name, priority } = self;
        if !(PRI_MIN..=PRI_MAX).contains(&priority) {
            return Err(KernelError::InvalidArgument);
        }
        {
            let guard = KERNEL.lock();
            let running = guard.is_some();
            guard.unlock();
            if !running {
                return Err(KernelError::NotRunning);
            }
        }
        let gate = Arc::new(Gate::new());
        let exit = Arc::new(ExitState::new());
        let body_gate = gate.clone();
        // The host handle is dropped on purpose: joining goes through the
        // exit semaphore, never through the host.
        let _detached = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // First scheduling opens the gate.
                body_gate.wait();
                let code = match panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(()) => 0,
                    Err(payload) => payload.downcast_ref::<ThreadExit>().map_or(-1, |e| e.0),
                };
                finish(code);
            })
            .map_err(|_| KernelError::NoResource)?;
        let tid = with_kernel(|k| {
            let tid = k.alloc_tid();
            let nice = k.current_thread().nice;
            let th = Thread::new(tid, name, priority, nice, gate, exit.clone());
            k.threads.insert(tid, th);
            k.insert_ready(tid);
            log::trace!("spawned {tid:?} at priority {priority}");
            tid
        });
        scheduler::maybe_preempt();
        Ok(JoinHandle { tid, exit })
    }
}

/// Exit path shared by normal returns, panics, and [`Current::exit`]: run
/// cleanup hooks, wake the joiner, leave the arena, hand off the CPU.
fn finish(code: i32) {
    let hooks = with_kernel(|k| std::mem::take(&mut k.current_thread().cleanup));
    for hook in hooks {
        hook();
    }
    // The joiner is woken while the exiting thread is still schedulable, so
    // the wake may preempt us like any other.
    let exit = with_kernel(|k| k.current_thread().exit.clone());
    exit.code.store(code, Ordering::SeqCst);
    exit.done.up();
    let mut guard = KERNEL.lock();
    let k = guard.as_mut().expect("kernel is not running");
    let me = k.current;
    k.thread_mut(me).state = ThreadState::Dying;
    k.threads.remove(&me);
    log::trace!("{me:?} exited with code {code}");
    scheduler::switch_out(guard);
    // The control block is gone, so switch_out wakes the successor without
    // waiting, and the host thread ends here.
}

/// Yields the CPU: the caller goes to the back of its priority band and the
/// best ready thread runs next.
pub fn yield_now() {
    let mut guard = KERNEL.lock();
    let Some(k) = guard.as_mut() else {
        guard.unlock();
        return;
    };
    if k.ready_count() == 0 {
        guard.unlock();
        return;
    }
    let me = k.current;
    k.insert_ready(me);
    scheduler::switch_out(guard);
}

/// Sets the calling thread's base priority, clamped to
/// `[PRI_MIN, PRI_MAX]`, and yields immediately if the thread no longer has
/// the highest effective priority. Donations it is receiving stay in force.
/// A no-op under MLFQS.
pub fn set_priority(priority: i32) {
    let changed = with_kernel(|k| {
        if k.mlfqs {
            return false;
        }
        let me = k.current;
        k.thread_mut(me).base_priority = priority.clamp(PRI_MIN, PRI_MAX);
        donation::refresh_effective(k, me);
        true
    });
    if changed {
        scheduler::maybe_preempt();
    }
}

/// The calling thread's effective priority.
pub fn get_priority() -> i32 {
    with_kernel(|k| k.current_thread().effective_priority)
}

/// Effective priority of an arbitrary live thread.
///
/// # Errors
/// [`KernelError::NoSuchThread`] once the thread has exited.
pub fn get_priority_by_tid(tid: Tid) -> Result<i32, KernelError> {
    with_kernel(|k| {
        k.threads
            .get(&tid)
            .map(|t| t.effective_priority)
            .ok_or(KernelError::NoSuchThread)
    })
}

/// State of an arbitrary thread.
///
/// # Errors
/// [`KernelError::NoSuchThread`] once the thread has exited.
pub fn get_state_by_tid(tid: Tid) -> Result<ThreadState, KernelError> {
    with_kernel(|k| {
        k.threads
            .get(&tid)
            .map(|t| t.state)
            .ok_or(KernelError::NoSuchThread)
    })
}

/// Sets the calling thread's nice value, clamped to `[-20, 20]`. Under MLFQS
/// the thread's priority is recomputed at once and the thread yields if it
/// no longer has the highest.
pub fn set_nice(nice: i32) {
    with_kernel(|k| {
        let me = k.current;
        k.thread_mut(me).nice = nice.clamp(-20, 20);
        if k.mlfqs {
            mlfqs::recompute_priority(k, me);
        }
    });
    scheduler::maybe_preempt();
}

/// The calling thread's nice value.
pub fn get_nice() -> i32 {
    with_kernel(|k| k.current_thread().nice)
}

/// 100 times the calling thread's recent CPU figure, rounded to nearest.
pub fn get_recent_cpu() -> i32 {
    with_kernel(|k| k.current_thread().recent_cpu.mul_int(100).round())
}

/// 100 times the system load average, rounded to nearest.
pub fn get_load_avg() -> i32 {
    with_kernel(|k| k.load_avg.mul_int(100).round())
}
