use super::*;
use crate::rt::StdRuntime;
use core::pin::pin;

type Condvar = super::Condvar<StdRuntime>;
type Mutex<T> = crate::mutex::Mutex<T, StdRuntime>;

fn record() -> WaitRecord<StdRuntime> {
    WaitRecord::new(std::thread::current())
}

#[test]
fn send_and_sync() {
    crate::util::test::assert_send_sync::<Condvar>();
    crate::util::test::assert_send_sync::<Mutex<usize>>();
}

#[test]
fn wake_with_no_waiters_is_a_noop() {
    crate::loom::model(|| {
        let condvar = Condvar::new();
        condvar.wake_one();
        condvar.wake_all();
        condvar.wake_one();
        assert_eq!(condvar.waiters(), 0);
    });
}

#[test]
fn fifo_push_pop_remove() {
    crate::loom::model(|| {
        let a = pin!(record());
        let b = pin!(record());
        let c = pin!(record());
        let (pa, pb, pc) = (NonNull::from(&*a), NonNull::from(&*b), NonNull::from(&*c));

        let mut fifo = Fifo::<StdRuntime>::new();
        assert!(fifo.is_empty());
        unsafe {
            fifo.push(pa);
            fifo.push(pb);
            fifo.push(pc);
            assert!(!fifo.is_empty());

            // removing from the middle relinks its neighbors
            assert!(fifo.remove(pb));
            assert!(!fifo.remove(pb));

            assert_eq!(fifo.pop(), Some(pa));
            // removing the newest record must fix the tail pointer
            assert!(fifo.remove(pc));
            assert!(fifo.is_empty());
            assert_eq!(fifo.pop(), None);
        }
    });
}

#[test]
fn fifo_remove_tail_then_push() {
    crate::loom::model(|| {
        let a = pin!(record());
        let b = pin!(record());
        let c = pin!(record());
        let (pa, pb, pc) = (NonNull::from(&*a), NonNull::from(&*b), NonNull::from(&*c));

        let mut fifo = Fifo::<StdRuntime>::new();
        unsafe {
            fifo.push(pa);
            fifo.push(pb);
            assert!(fifo.remove(pb));
            // the tail now points at `a` again, so a push must land after it
            fifo.push(pc);
            assert_eq!(fifo.pop(), Some(pa));
            assert_eq!(fifo.pop(), Some(pc));
            assert_eq!(fifo.pop(), None);
        }
    });
}

#[test]
fn fifo_take_all_keeps_the_chain_threaded() {
    crate::loom::model(|| {
        let a = pin!(record());
        let b = pin!(record());
        let c = pin!(record());
        let (pa, pb, pc) = (NonNull::from(&*a), NonNull::from(&*b), NonNull::from(&*c));

        let mut fifo = Fifo::<StdRuntime>::new();
        unsafe {
            fifo.push(pa);
            fifo.push(pb);
            fifo.push(pc);

            let head = fifo.take_all();
            assert!(fifo.is_empty());
            assert_eq!(fifo.pop(), None);

            assert_eq!(head, Some(pa));
            assert_eq!(pa.as_ref().next(), Some(pb));
            assert_eq!(pb.as_ref().next(), Some(pc));
            assert_eq!(pc.as_ref().next(), None);
        }
    });
}

#[cfg(not(loom))]
mod threaded {
    use super::*;
    use crate::{loom::thread, util::test::trace_init, WaitTimeoutResult};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::Relaxed},
            Arc,
        },
        time::{Duration, Instant},
    };

    #[test]
    fn wake_one_single_waiter() {
        let _trace = trace_init();
        let pair = Arc::new((Mutex::new(false), Condvar::new()));

        let waiter = thread::spawn({
            let pair = pair.clone();
            move || {
                let (mutex, condvar) = &*pair;
                let mut ready = mutex.lock();
                while !*ready {
                    ready = condvar.wait(ready);
                }
                assert!(*ready);
            }
        });

        let (mutex, condvar) = &*pair;
        *mutex.lock() = true;
        condvar.wake_one();

        waiter.join().unwrap();
        assert_eq!(condvar.waiters(), 0);
    }

    #[test]
    fn wait_until_times_out() {
        let _trace = trace_init();
        let mutex = Mutex::new(0u32);
        let condvar = Condvar::new();

        let guard = mutex.lock();
        let deadline = Instant::now() + Duration::from_millis(50);
        let (mut guard, result) = condvar.wait_until(guard, deadline);

        assert!(result.timed_out());
        assert!(Instant::now() >= deadline);
        assert_eq!(condvar.waiters(), 0);

        // the user mutex was re-acquired
        *guard += 1;
        assert_eq!(*guard, 1);
    }

    #[test]
    fn wait_until_signalled_before_deadline() {
        let _trace = trace_init();
        let pair = Arc::new((Mutex::new(false), Condvar::new()));

        let waiter = thread::spawn({
            let pair = pair.clone();
            move || {
                let (mutex, condvar) = &*pair;
                let deadline = Instant::now() + Duration::from_secs(60);
                let mut ready = mutex.lock();
                let mut result = WaitTimeoutResult::new(false);
                while !*ready && !result.timed_out() {
                    (ready, result) = condvar.wait_until(ready, deadline);
                }
                assert!(*ready, "the wait must end by signal, not timeout");
                assert!(!result.timed_out());
            }
        });

        let (mutex, condvar) = &*pair;
        while condvar.waiters() == 0 {
            thread::yield_now();
        }
        *mutex.lock() = true;
        condvar.wake_one();
        waiter.join().unwrap();
    }

    /// A short deadline racing a signaller that fires at roughly the same
    /// moment. Every iteration must end with the guard held and exactly one
    /// of {signalled, timed out}; a waiter that loses the unlink race must
    /// fall back to the signalled path.
    #[test]
    fn timeout_races_wake_one() {
        const ITERATIONS: usize = 200;
        let _trace = trace_init();
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let signalled = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));

        for i in 0..ITERATIONS {
            *pair.0.lock() = false;

            let waiter = thread::spawn({
                let pair = pair.clone();
                let signalled = signalled.clone();
                let timeouts = timeouts.clone();
                move || {
                    let (mutex, condvar) = &*pair;
                    let deadline = Instant::now() + Duration::from_micros((i % 5) as u64 * 200);
                    let mut ready = mutex.lock();
                    let mut result = WaitTimeoutResult::new(false);
                    while !*ready && !result.timed_out() {
                        (ready, result) = condvar.wait_until(ready, deadline);
                    }
                    if result.timed_out() {
                        timeouts.fetch_add(1, Relaxed);
                    } else {
                        signalled.fetch_add(1, Relaxed);
                    }
                    // on either path, the guard is live and the data
                    // accessible
                    let _ = *ready;
                }
            });

            std::thread::sleep(Duration::from_micros(400));
            {
                let (mutex, condvar) = &*pair;
                *mutex.lock() = true;
                condvar.wake_one();
            }
            waiter.join().unwrap();
            assert_eq!(pair.1.waiters(), 0);
        }

        assert_eq!(signalled.load(Relaxed) + timeouts.load(Relaxed), ITERATIONS);
    }

    struct Rendezvous {
        /// How many waiters have taken their place in line.
        present: usize,
        go: bool,
        order: Vec<usize>,
    }

    /// Enqueues `count` waiters in a deterministic order (each thread claims
    /// its slot under the user mutex and keeps the mutex held until its wait
    /// links it), then runs `signal` and collects the order in which the
    /// waiters re-acquired the mutex.
    fn run_in_order(count: usize, signal: impl FnOnce(&Condvar)) -> Vec<usize> {
        let state = Arc::new((
            Mutex::new(Rendezvous {
                present: 0,
                go: false,
                order: Vec::new(),
            }),
            Condvar::new(),
        ));

        let waiters: Vec<_> = (0..count)
            .map(|i| {
                thread::spawn({
                    let state = state.clone();
                    move || {
                        let (mutex, condvar) = &*state;
                        loop {
                            let mut s = mutex.lock();
                            if s.present == i {
                                s.present += 1;
                                while !s.go {
                                    s = condvar.wait(s);
                                }
                                s.order.push(i);
                                return;
                            }
                            drop(s);
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let (mutex, condvar) = &*state;
        loop {
            let mut s = mutex.lock();
            if s.present == count {
                s.go = true;
                drop(s);
                break;
            }
            drop(s);
            thread::yield_now();
        }
        signal(condvar);

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(condvar.waiters(), 0);
        let state = Arc::into_inner(state).unwrap();
        state.0.into_inner().order
    }

    #[test]
    fn wake_all_wakes_every_waiter() {
        let _trace = trace_init();
        let mut order = run_in_order(3, |condvar| condvar.wake_all());
        order.sort_unstable();
        assert_eq!(order, [0, 1, 2]);
    }

    /// With wait morphing, a `wake_all` hands the user mutex through the
    /// waiters in enqueue order, so the waiters run in FIFO order.
    #[cfg(feature = "wait-morphing")]
    #[test]
    fn wake_all_fifo_handoff() {
        let _trace = trace_init();
        let order = run_in_order(3, |condvar| condvar.wake_all());
        assert_eq!(order, [0, 1, 2]);
    }

    #[test]
    fn wake_one_wakes_in_fifo_order() {
        let _trace = trace_init();
        let order = run_in_order(3, |condvar| {
            condvar.wake_one();
            condvar.wake_one();
            condvar.wake_one();
        });
        #[cfg(feature = "wait-morphing")]
        assert_eq!(order, [0, 1, 2]);
        #[cfg(not(feature = "wait-morphing"))]
        {
            let mut order = order;
            order.sort_unstable();
            assert_eq!(order, [0, 1, 2]);
        }
    }

    #[test]
    fn wake_one_is_never_lost() {
        const THREADS: usize = 4;
        let _trace = trace_init();
        let state = Arc::new((Mutex::new(0usize), Condvar::new()));

        let waiters: Vec<_> = (0..THREADS)
            .map(|_| {
                thread::spawn({
                    let state = state.clone();
                    move || {
                        let (mutex, condvar) = &*state;
                        let mut permits = mutex.lock();
                        while *permits == 0 {
                            permits = condvar.wait(permits);
                        }
                        *permits -= 1;
                    }
                })
            })
            .collect();

        let (mutex, condvar) = &*state;
        while condvar.waiters() != THREADS {
            thread::yield_now();
        }
        for _ in 0..THREADS {
            *mutex.lock() += 1;
            condvar.wake_one();
        }

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 0);
        assert_eq!(condvar.waiters(), 0);
    }

    #[cfg(feature = "wait-morphing")]
    #[test]
    fn mixed_mutexes_panic() {
        let _trace = trace_init();
        let state = Arc::new((Mutex::new(false), Mutex::new(false), Condvar::new()));

        let waiter = thread::spawn({
            let state = state.clone();
            move || {
                let (m1, _, condvar) = &*state;
                let mut ready = m1.lock();
                while !*ready {
                    ready = condvar.wait(ready);
                }
            }
        });
        while state.2.waiters() == 0 {
            thread::yield_now();
        }

        // a concurrent wait through a different mutex is a usage bug
        let result = thread::spawn({
            let state = state.clone();
            move || {
                let (_, m2, condvar) = &*state;
                let _ = condvar.wait(m2.lock());
            }
        })
        .join();
        let panic = result.expect_err("waiting with a second mutex must panic");
        let message = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .expect("the panic payload is the assertion message");
        assert!(message.contains("same mutex"), "unexpected panic: {message}");

        // the condvar (and both mutexes) survived the unwind
        *state.0.lock() = true;
        state.2.wake_one();
        waiter.join().unwrap();
        assert!(!*state.1.lock());
    }

    mod affinity {
        use super::*;
        use crate::rt::Runtime;
        use std::{
            collections::HashMap,
            sync::{Mutex as StdMutex, OnceLock},
            thread::ThreadId,
        };

        /// A [`StdRuntime`] whose CPU assignments come from a registry that
        /// tests fill in, so the affinity-grouping walk in `wake_all` has
        /// something to group by.
        struct PinnedRuntime;

        fn cpus() -> &'static StdMutex<HashMap<ThreadId, usize>> {
            static CPUS: OnceLock<StdMutex<HashMap<ThreadId, usize>>> = OnceLock::new();
            CPUS.get_or_init(Default::default)
        }

        fn pin_current(cpu: usize) {
            cpus()
                .lock()
                .unwrap()
                .insert(std::thread::current().id(), cpu);
        }

        impl Runtime for PinnedRuntime {
            type Thread = std::thread::Thread;
            type Instant = std::time::Instant;

            fn current() -> Self::Thread {
                StdRuntime::current()
            }
            fn now() -> Self::Instant {
                StdRuntime::now()
            }
            fn park() {
                StdRuntime::park()
            }
            fn park_until(deadline: Self::Instant) {
                StdRuntime::park_until(deadline)
            }
            fn unpark(thread: &Self::Thread) {
                StdRuntime::unpark(thread)
            }
            fn current_cpu(thread: &Self::Thread) -> usize {
                cpus().lock().unwrap().get(&thread.id()).copied().unwrap_or(0)
            }
            fn preempt_disable() {}
            fn preempt_enable() {}
        }

        /// Five waiters spread across two CPUs, woken all at once. Any
        /// FIFO-consistent handoff order is legal; what must hold is that
        /// every waiter returns exactly once, holding the mutex.
        #[test]
        fn wake_all_across_cpus() {
            const CPUS: [usize; 5] = [0, 1, 0, 1, 0];
            let _trace = trace_init();
            let state = Arc::new((
                crate::mutex::Mutex::<_, PinnedRuntime>::new((0usize, false)),
                crate::condvar::Condvar::<PinnedRuntime>::new(),
            ));
            let completions = Arc::new(AtomicUsize::new(0));

            let waiters: Vec<_> = CPUS
                .iter()
                .enumerate()
                .map(|(i, &cpu)| {
                    thread::spawn({
                        let state = state.clone();
                        let completions = completions.clone();
                        move || {
                            pin_current(cpu);
                            let (mutex, condvar) = &*state;
                            loop {
                                let mut s = mutex.lock();
                                if s.0 == i {
                                    s.0 += 1;
                                    while !s.1 {
                                        s = condvar.wait(s);
                                    }
                                    // still holding the mutex here
                                    completions.fetch_add(1, Relaxed);
                                    return;
                                }
                                drop(s);
                                thread::yield_now();
                            }
                        }
                    })
                })
                .collect();

            let (mutex, condvar) = &*state;
            loop {
                let mut s = mutex.lock();
                if s.0 == CPUS.len() {
                    s.1 = true;
                    drop(s);
                    break;
                }
                drop(s);
                thread::yield_now();
            }
            condvar.wake_all();

            for waiter in waiters {
                waiter.join().unwrap();
            }
            assert_eq!(completions.load(Relaxed), CPUS.len());
            assert_eq!(condvar.waiters(), 0);
        }
    }
}
