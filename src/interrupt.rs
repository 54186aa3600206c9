//! Preemption control.
//!
//! The hosted stand-in for disabling interrupts: while an [`InterruptGuard`]
//! is alive the scheduler will not preempt the calling thread. A preemption
//! that becomes due in the meantime is latched and delivered when the last
//! guard drops. Blocking while a guard is held is a fatal error.

use crate::thread::{self, scheduler::with_kernel};
use core::marker::PhantomData;

/// Defers preemption of the calling thread while alive. Guards nest.
///
/// ```
/// use kestrel::interrupt::InterruptGuard;
///
/// kestrel::run(|| {
///     let guard = InterruptGuard::new();
///     // No preemption in here, whatever becomes ready.
///     drop(guard);
/// });
/// ```
pub struct InterruptGuard {
    // Pins the guard to the creating thread.
    _not_send: PhantomData<*mut ()>,
}

impl InterruptGuard {
    /// Begins a non-preemptible section.
    pub fn new() -> Self {
        with_kernel(|k| k.preempt_depth += 1);
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let fire = with_kernel(|k| {
            k.preempt_depth -= 1;
            if k.preempt_depth == 0 && k.preempt_pending {
                k.preempt_pending = false;
                true
            } else {
                false
            }
        });
        if fire {
            thread::yield_now();
        }
    }
}
