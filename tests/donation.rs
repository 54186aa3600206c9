//! Priority donation: single donations, donations across several locks, and
//! transitive chains.

use kestrel::sync::{Lock, Semaphore};
use kestrel::thread::{self, ThreadBuilder, ThreadState};
use kestrel::{PRI_DEFAULT, PRI_MAX, PRI_MIN};
use std::sync::Arc;

#[test]
fn a_blocked_waiter_donates_to_the_holder() {
    kestrel::run(|| {
        let lock = Arc::new(Lock::new());
        lock.acquire();

        let waiter_lock = lock.clone();
        let waiter = ThreadBuilder::new("hi")
            .priority(PRI_DEFAULT + 3)
            .spawn(move || {
                waiter_lock.acquire();
                waiter_lock.release();
            })
            .unwrap();

        // The waiter preempted us, blocked on the lock, and donated.
        assert_eq!(thread::get_priority(), PRI_DEFAULT + 3);
        assert_eq!(
            thread::get_state_by_tid(waiter.tid()),
            Ok(ThreadState::Blocked)
        );

        // Lowering our base while donated changes nothing visible.
        thread::set_priority(PRI_DEFAULT - 10);
        assert_eq!(thread::get_priority(), PRI_DEFAULT + 3);

        lock.release();
        assert_eq!(thread::get_priority(), PRI_DEFAULT - 10);
        assert_eq!(waiter.join(), 0);
    });
}

#[test]
fn donations_unwind_one_lock_at_a_time() {
    kestrel::run(|| {
        let la = Arc::new(Lock::new());
        let lb = Arc::new(Lock::new());
        la.acquire();
        lb.acquire();

        let l = la.clone();
        let first = ThreadBuilder::new("first")
            .priority(PRI_DEFAULT + 5)
            .spawn(move || {
                l.acquire();
                l.release();
            })
            .unwrap();
        let l = lb.clone();
        let second = ThreadBuilder::new("second")
            .priority(PRI_DEFAULT + 2)
            .spawn(move || {
                l.acquire();
                l.release();
            })
            .unwrap();

        assert_eq!(thread::get_priority(), PRI_DEFAULT + 5);
        la.release();
        // The first waiter is gone; the second one's donation remains.
        assert_eq!(thread::get_priority(), PRI_DEFAULT + 2);
        lb.release();
        assert_eq!(thread::get_priority(), PRI_DEFAULT);
        assert_eq!(first.join(), 0);
        assert_eq!(second.join(), 0);
    });
}

/// C (40) blocks on a lock held by B (20), which blocks on a lock held by
/// A (10): the donation must carry all the way down to A, and releasing the
/// locks must unwind it.
#[test]
fn donations_propagate_through_lock_chains() {
    kestrel::run(|| {
        thread::set_priority(PRI_MAX);
        let l1 = Arc::new(Lock::new());
        let l2 = Arc::new(Lock::new());
        let hold = Arc::new(Semaphore::new(0));
        let step = Arc::new(Semaphore::new(0));

        let (l, h, s) = (l1.clone(), hold.clone(), step.clone());
        let a = ThreadBuilder::new("a")
            .priority(10)
            .spawn(move || {
                l.acquire();
                s.up();
                h.down(); // keep l1 held until the chain is assembled
                l.release();
                assert_eq!(thread::get_priority(), 10);
            })
            .unwrap();
        step.down(); // A holds l1

        let (la, lb, s) = (l1.clone(), l2.clone(), step.clone());
        let b = ThreadBuilder::new("b")
            .priority(20)
            .spawn(move || {
                lb.acquire();
                s.up();
                la.acquire(); // blocks behind A, donating
                la.release();
                lb.release();
            })
            .unwrap();
        step.down(); // B holds l2

        // Step aside so B can block on l1 and A can park on its semaphore.
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);
        assert_eq!(thread::get_priority_by_tid(a.tid()), Ok(20));
        assert_eq!(thread::get_state_by_tid(b.tid()), Ok(ThreadState::Blocked));

        let l = l2.clone();
        let c = ThreadBuilder::new("c")
            .priority(40)
            .spawn(move || {
                l.acquire(); // blocks behind B; the boost rides down to A
                l.release();
            })
            .unwrap();
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);
        assert_eq!(thread::get_priority_by_tid(a.tid()), Ok(40));
        assert_eq!(thread::get_priority_by_tid(b.tid()), Ok(40));

        // Let go: A finishes, the chain unwinds through B to C.
        hold.up();
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);
        assert_eq!(a.join(), 0);
        assert_eq!(b.join(), 0);
        assert_eq!(c.join(), 0);
    });
}

/// A release with waiters hands the lock straight to the woken thread, so
/// for a moment the lock is committed but has no registered holder. A thread
/// that blocks during that window must still end up donating once the new
/// holder registers itself.
#[test]
fn a_waiter_parked_during_handoff_still_donates() {
    kestrel::run(|| {
        thread::set_priority(PRI_MAX);
        let lock = Arc::new(Lock::new());
        lock.acquire();

        let l = lock.clone();
        let next = ThreadBuilder::new("next")
            .priority(30)
            .spawn(move || {
                l.acquire();
                // The high-priority thread that parked while the lock was in
                // flight must already be boosting us.
                assert_eq!(thread::get_priority(), PRI_MAX);
                l.release();
            })
            .unwrap();
        // Step aside until `next` is parked on the lock.
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);
        assert_eq!(thread::get_state_by_tid(next.tid()), Ok(ThreadState::Blocked));

        // Hands the lock to `next` without running it; the holder registry is
        // empty until `next` gets the CPU.
        lock.release();
        lock.acquire();
        lock.release();
        assert_eq!(next.join(), 0);
    });
}

#[test]
#[should_panic(expected = "already held")]
fn reacquiring_a_held_lock_is_fatal() {
    kestrel::run(|| {
        let lock = Lock::new();
        lock.acquire();
        lock.acquire();
    });
}

#[test]
#[should_panic(expected = "already held")]
fn try_acquiring_a_held_lock_is_fatal() {
    kestrel::run(|| {
        let lock = Lock::new();
        lock.acquire();
        let _ = lock.try_acquire();
    });
}

#[test]
#[should_panic(expected = "does not hold")]
fn releasing_an_unheld_lock_is_fatal() {
    kestrel::run(|| {
        Lock::new().release();
    });
}
