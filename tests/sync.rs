//! Blocking primitives: semaphores, locks, condition variables, and thread
//! exit plumbing.

use kestrel::sync::{Condvar, Lock, Semaphore, SpinLock, WouldBlock};
use kestrel::thread::{self, Current, ThreadBuilder, ThreadState};
use kestrel::{KernelError, PRI_MAX, PRI_MIN};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

#[test]
fn semaphore_wakes_the_highest_priority_waiter() {
    kestrel::run(|| {
        thread::set_priority(PRI_MAX);
        let sem = Arc::new(Semaphore::new(0));
        let order = Arc::new(SpinLock::new(Vec::new()));
        let mut waiters = Vec::new();
        for priority in [10, 30, 20] {
            let (sem, order) = (sem.clone(), order.clone());
            waiters.push(
                ThreadBuilder::new(format!("w{priority}"))
                    .priority(priority)
                    .spawn(move || {
                        sem.down();
                        let mut order = order.lock();
                        order.push(priority);
                        order.unlock();
                    })
                    .unwrap(),
            );
        }
        // Step aside until all three are parked on the semaphore.
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);
        for _ in 0..3 {
            sem.up();
        }
        for waiter in waiters {
            assert_eq!(waiter.join(), 0);
        }
        let order = order.lock();
        assert_eq!(*order, vec![30, 20, 10]);
        order.unlock();
    });
}

/// Wake order follows the waiters' priorities at the moment of the `up`, not
/// at the moment they parked: a donation received while parked moves a waiter
/// ahead of one that outranked it going in.
#[test]
fn semaphore_wake_order_tracks_priority_changes_while_parked() {
    kestrel::run(|| {
        thread::set_priority(PRI_MAX);
        let sem = Arc::new(Semaphore::new(0));
        let gate = Arc::new(Lock::new());
        let order = Arc::new(SpinLock::new(Vec::new()));

        let (s, l, o) = (sem.clone(), gate.clone(), order.clone());
        let sleeper = ThreadBuilder::new("sleeper")
            .priority(20)
            .spawn(move || {
                l.acquire();
                s.down(); // parks at 20; boosted to 50 while asleep
                let mut o = o.lock();
                o.push("sleeper");
                o.unlock();
                l.release();
            })
            .unwrap();
        let (s, o) = (sem.clone(), order.clone());
        let rival = ThreadBuilder::new("rival")
            .priority(25)
            .spawn(move || {
                s.down();
                let mut o = o.lock();
                o.push("rival");
                o.unlock();
            })
            .unwrap();
        // Step aside until both are parked.
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);

        // A high-priority thread blocks on the sleeper's lock and donates.
        let l = gate.clone();
        let booster = ThreadBuilder::new("booster")
            .priority(50)
            .spawn(move || {
                l.acquire();
                l.release();
            })
            .unwrap();
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);
        assert_eq!(thread::get_priority_by_tid(sleeper.tid()), Ok(50));

        sem.up();
        sem.up();
        assert_eq!(sleeper.join(), 0);
        assert_eq!(rival.join(), 0);
        assert_eq!(booster.join(), 0);
        let order = order.lock();
        assert_eq!(*order, vec!["sleeper", "rival"]);
        order.unlock();
    });
}

#[test]
fn non_blocking_attempts() {
    kestrel::run(|| {
        let sem = Semaphore::new(1);
        assert!(sem.try_down().is_ok());
        assert_eq!(sem.try_down(), Err(WouldBlock));
        sem.up();
        assert!(sem.try_down().is_ok());

        let lock = Lock::new();
        assert!(lock.try_acquire().is_ok());
        assert!(lock.held_by_current());
        lock.release();
        assert!(!lock.held_by_current());
    });
}

#[test]
fn a_lock_serializes_its_critical_section() {
    kestrel::run(|| {
        let lock = Arc::new(Lock::new());
        let count = Arc::new(SpinLock::new(0u32));
        let mut adders = Vec::new();
        for _ in 0..8 {
            let (lock, count) = (lock.clone(), count.clone());
            adders.push(
                ThreadBuilder::new("adder")
                    .spawn(move || {
                        for _ in 0..100 {
                            lock.acquire();
                            let mut count = count.lock();
                            *count += 1;
                            count.unlock();
                            lock.release();
                            thread::yield_now();
                        }
                    })
                    .unwrap(),
            );
        }
        for adder in adders {
            assert_eq!(adder.join(), 0);
        }
        let count = count.lock();
        assert_eq!(*count, 800);
        count.unlock();
    });
}

#[test]
fn condvar_signals_the_highest_priority_waiter() {
    kestrel::run(|| {
        thread::set_priority(PRI_MAX);
        let lock = Arc::new(Lock::new());
        let cond = Arc::new(Condvar::new());
        let order = Arc::new(SpinLock::new(Vec::new()));
        let mut waiters = Vec::new();
        for priority in [20, 40, 30] {
            let (lock, cond, order) = (lock.clone(), cond.clone(), order.clone());
            waiters.push(
                ThreadBuilder::new(format!("w{priority}"))
                    .priority(priority)
                    .spawn(move || {
                        lock.acquire();
                        cond.wait(&lock);
                        let mut order = order.lock();
                        order.push(priority);
                        order.unlock();
                        lock.release();
                    })
                    .unwrap(),
            );
        }
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);
        for _ in 0..3 {
            lock.acquire();
            cond.signal(&lock);
            lock.release();
        }
        for waiter in waiters {
            assert_eq!(waiter.join(), 0);
        }
        let order = order.lock();
        assert_eq!(*order, vec![40, 30, 20]);
        order.unlock();
    });
}

#[test]
fn broadcast_wakes_only_the_waiters_present() {
    kestrel::run(|| {
        thread::set_priority(PRI_MAX);
        let lock = Arc::new(Lock::new());
        let cond = Arc::new(Condvar::new());
        let woken = Arc::new(AtomicUsize::new(0));
        let mut waiters = Vec::new();
        for priority in [10, 11, 12] {
            let (lock, cond, woken) = (lock.clone(), cond.clone(), woken.clone());
            waiters.push(
                ThreadBuilder::new(format!("w{priority}"))
                    .priority(priority)
                    .spawn(move || {
                        lock.acquire();
                        cond.wait(&lock);
                        woken.fetch_add(1, SeqCst);
                        lock.release();
                    })
                    .unwrap(),
            );
        }
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);

        lock.acquire();
        cond.broadcast(&lock);
        lock.release();

        // A thread that starts waiting after the broadcast stays blocked.
        let (l, cv) = (lock.clone(), cond.clone());
        let late = ThreadBuilder::new("late")
            .priority(12)
            .spawn(move || {
                l.acquire();
                cv.wait(&l);
                l.release();
            })
            .unwrap();
        thread::set_priority(PRI_MIN);
        thread::set_priority(PRI_MAX);

        assert_eq!(woken.load(SeqCst), 3);
        assert_eq!(
            thread::get_state_by_tid(late.tid()),
            Ok(ThreadState::Blocked)
        );

        lock.acquire();
        cond.signal(&lock);
        lock.release();
        assert_eq!(late.join(), 0);
        for waiter in waiters {
            assert_eq!(waiter.join(), 0);
        }
    });
}

#[test]
fn cleanup_hooks_run_on_every_exit_path() {
    kestrel::run(|| {
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let normal = ThreadBuilder::new("normal")
            .spawn(move || {
                let counter = counter.clone();
                Current::register_cleanup(move || {
                    counter.fetch_add(1, SeqCst);
                });
            })
            .unwrap();
        assert_eq!(normal.join(), 0);
        assert_eq!(ran.load(SeqCst), 1);

        let counter = ran.clone();
        let panicky = ThreadBuilder::new("panicky")
            .spawn(move || {
                let counter = counter.clone();
                Current::register_cleanup(move || {
                    counter.fetch_add(1, SeqCst);
                });
                panic!("expected failure");
            })
            .unwrap();
        assert_eq!(panicky.join(), -1);
        assert_eq!(ran.load(SeqCst), 2);

        let counter = ran.clone();
        let explicit = ThreadBuilder::new("explicit")
            .spawn(move || {
                let counter = counter.clone();
                Current::register_cleanup(move || {
                    counter.fetch_add(1, SeqCst);
                });
                Current::exit(7);
            })
            .unwrap();
        assert_eq!(explicit.join(), 7);
        assert_eq!(ran.load(SeqCst), 3);
    });
}

#[test]
fn spawn_rejects_out_of_range_priorities() {
    kestrel::run(|| {
        let err = ThreadBuilder::new("bad")
            .priority(PRI_MAX + 1)
            .spawn(|| {})
            .err();
        assert_eq!(err, Some(KernelError::InvalidArgument));
        let err = ThreadBuilder::new("bad")
            .priority(PRI_MIN - 1)
            .spawn(|| {})
            .err();
        assert_eq!(err, Some(KernelError::InvalidArgument));
    });
}

#[test]
#[should_panic(expected = "without holding the lock")]
fn waiting_without_the_lock_is_fatal() {
    kestrel::run(|| {
        let lock = Lock::new();
        let cond = Condvar::new();
        cond.wait(&lock);
    });
}
