//! Kernel time.
//!
//! Time is a tick counter advanced synchronously: the running thread (in
//! tests, the test body plays the timer) calls [`tick`] to deliver one timer
//! interrupt. Sleeping threads are keyed by absolute wake-up tick; when
//! nothing is runnable the scheduler fast-forwards the counter to the next
//! wake-up instead of spinning.

use crate::thread::scheduler::{self, with_kernel};

/// Timer ticks per second of kernel time.
pub const TIMER_FREQ: i64 = 100;

/// The number of ticks since boot.
pub fn ticks() -> i64 {
    with_kernel(|k| k.ticks)
}

/// Delivers one timer tick: wakes due sleepers, runs the periodic MLFQS
/// recomputations, and preempts the caller if a ready thread now outranks it
/// or its time slice is used up.
pub fn tick() {
    scheduler::timer_tick();
}

/// Blocks the calling thread for `duration` ticks. Returns immediately if
/// `duration` is not positive.
pub fn sleep(duration: i64) {
    if duration <= 0 {
        return;
    }
    let now = ticks();
    scheduler::sleep_until(now + duration);
}

/// Blocks the calling thread until the tick counter reaches `wake_tick`.
/// Returns immediately if that tick has already passed.
pub fn sleep_until(wake_tick: i64) {
    scheduler::sleep_until(wake_tick);
}
