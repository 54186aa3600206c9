//! Synchronization primitives.
//!
//! [`SpinLock`] is the busy-waiting building block everything else stands on;
//! it never interacts with the scheduler. [`Semaphore`], [`Lock`], and
//! [`Condvar`] are the blocking primitives: a thread that cannot proceed is
//! parked and consumes no CPU until another thread wakes it.

pub mod condvar;
pub mod lock;
pub mod semaphore;
pub mod spinlock;

pub use condvar::Condvar;
pub use lock::Lock;
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
