//! # kestrel: a hosted kernel threading core.
//!
//! kestrel is the thread-scheduling heart of a teaching kernel, re-hosted on
//! top of the standard library so it can be driven and inspected from ordinary
//! tests. It provides priority-based preemptive scheduling with priority
//! donation, an optional multi-level feedback queue scheduler (MLFQS), and the
//! classic blocking primitives built on top of it: counting semaphores, locks,
//! and condition variables.
//!
//! ## Execution model
//!
//! Every kernel thread is backed by a host OS thread, but the scheduler
//! guarantees that **at most one thread executes at a time**, exactly like a
//! single-core kernel with interrupts disabled inside the scheduler. Timer
//! interrupts are synchronous: the running thread (usually a test) calls
//! [`timer::tick`] to advance time. When every runnable thread is asleep, the
//! scheduler plays the idle thread and fast-forwards the tick counter to the
//! next wake-up.
//!
//! A kernel session is delimited by [`Builder::run`]:
//!
//! ```
//! use kestrel::thread::ThreadBuilder;
//!
//! kestrel::run(|| {
//!     let worker = ThreadBuilder::new("worker")
//!         .spawn(|| { /* runs under the kernel scheduler */ })
//!         .unwrap();
//!     assert_eq!(worker.join(), 0);
//! });
//! ```
//!
//! ## Scheduling policies
//!
//! The default policy is static priority scheduling: each thread carries a
//! base priority in `[PRI_MIN, PRI_MAX]`, the highest effective priority runs,
//! and locks donate priority to their holders to defeat priority inversion.
//! [`Builder::mlfqs`] switches to the feedback scheduler, where priorities are
//! derived from `recent_cpu` and `nice` and recomputed as time passes.

pub mod fixed;
pub mod interrupt;
pub mod sync;
pub mod thread;
pub mod timer;

use thiserror::Error;

/// Lowest thread priority.
pub const PRI_MIN: i32 = 0;
/// Default thread priority, given to the initial thread and to children whose
/// builder does not override it.
pub const PRI_DEFAULT: i32 = 31;
/// Highest thread priority.
pub const PRI_MAX: i32 = 63;

/// Errors that kernel operations can return.
///
/// Recoverable failures come back through this enum; invariant violations
/// (double-acquiring a lock, releasing a lock one does not hold, control
/// block corruption) are fatal and panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// An argument was outside its valid range.
    #[error("invalid argument")]
    InvalidArgument,
    /// The named thread does not exist (it may already have exited).
    #[error("no such thread")]
    NoSuchThread,
    /// The host refused to give us another thread.
    #[error("out of resources")]
    NoResource,
    /// The operation needs a running kernel and there is none.
    #[error("kernel is not running")]
    NotRunning,
}

/// Configure and boot a kernel session.
///
/// The builder selects the scheduling policy, then [`run`](Builder::run)
/// adopts the calling thread as the initial thread (`main`, [`PRI_DEFAULT`]),
/// executes the given closure under the scheduler, drains any threads that
/// are still alive when the closure returns, and tears the kernel down.
///
/// Sessions are serialized process-wide, so tests that each call `run` can
/// execute under the default parallel test harness.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    mlfqs: bool,
}

impl Builder {
    /// Creates a builder for the default static-priority policy.
    pub fn new() -> Self {
        Self { mlfqs: false }
    }

    /// Selects the multi-level feedback queue scheduler.
    ///
    /// Under MLFQS, priorities are computed from `recent_cpu` and `nice`;
    /// [`thread::set_priority`] becomes a no-op and locks do not donate.
    pub fn mlfqs(mut self, enable: bool) -> Self {
        self.mlfqs = enable;
        self
    }

    /// Boots the kernel, runs `f` as the main thread, and shuts down.
    pub fn run<R>(self, f: impl FnOnce() -> R) -> R {
        thread::scheduler::boot(self.mlfqs, f)
    }
}

/// Runs `f` under a default-configured kernel. Shorthand for
/// `Builder::new().run(f)`.
pub fn run<R>(f: impl FnOnce() -> R) -> R {
    Builder::new().run(f)
}
