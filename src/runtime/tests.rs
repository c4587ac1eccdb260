use crate::runtime::{Builder, Handle, JobSystem};
use crate::test_utils::*;
use crate::{Coro, FnJob, all, func, resume_on, thread_index};
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

assert_impl_all!(JobSystem: Send, Sync);
assert_impl_all!(Handle: Send, Sync, Clone);
assert_impl_all!(Coro<i32>: Send, Unpin);
assert_impl_all!(FnJob: Send);

#[rstest]
#[case::n_10(10)]
#[case::n_100(100)]
fn fan_out_sum_matches(#[case] n: i64) {
    let system = test_system(2);

    let children: Vec<Coro<i64>> = (0..n).map(|i| Coro::new(async move { i })).collect();
    let root = Coro::new(async move { all(children).await.into_iter().sum::<i64>() });

    system.schedule(&root);
    spin_until(|| root.is_finished(), SPIN_TIMEOUT);

    assert_eq!(root.get(), n * (n - 1) / 2);
    // Every job enters the scheduler exactly once: the root plus n children.
    assert_eq!(system.handle().tracker.claims(), (n + 1) as usize);
}

fn depth(n: u32) -> Coro<u32> {
    Coro::new(async move {
        if n == 0 {
            0
        } else {
            depth(n - 1).await + 1
        }
    })
}

#[test]
fn nested_depth_resolves_linearly() {
    let system = test_system(2);

    let root = depth(10);
    system.schedule(&root);
    spin_until(|| root.is_finished(), SPIN_TIMEOUT);

    assert_eq!(root.get(), 10);
    assert_eq!(system.handle().tracker.claims(), 11);
    // A linear chain stays linear: every coroutine is enqueued at most
    // twice (initial run + one resume), and the leaf only once.
    assert_eq!(system.handle().tracker.submits(), 21);
}

#[test]
fn affinity_pins_jobs_to_worker() {
    let system = test_system(2);

    let slots: Arc<Vec<AtomicUsize>> =
        Arc::new((0..50).map(|_| AtomicUsize::new(usize::MAX)).collect());
    let completed = Arc::new(AtomicUsize::new(0));

    for i in 0..50 {
        let slots = Arc::clone(&slots);
        let completed = Arc::clone(&completed);
        system.schedule(
            func(move || {
                slots[i].store(thread_index().expect("off-worker"), Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .with_affinity(1),
        );
    }

    spin_until(|| completed.load(Ordering::SeqCst) == 50, SPIN_TIMEOUT);
    for slot in slots.iter() {
        assert_eq!(slot.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn out_of_range_affinity_falls_back_to_shared_queue() {
    let system = test_system(2);
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    system.schedule(func(move || flag.store(true, Ordering::SeqCst)).with_affinity(99));

    spin_until(|| ran.load(Ordering::SeqCst), SPIN_TIMEOUT);
}

#[test]
fn thread_change_hops_between_workers() {
    let system = test_system(2);

    let root = Coro::new(async {
        resume_on(1).await;
        let first = thread_index().expect("off-worker");
        resume_on(0).await;
        let second = thread_index().expect("off-worker");
        (first, second)
    })
    .with_affinity(0);

    system.schedule(&root);
    spin_until(|| root.is_finished(), SPIN_TIMEOUT);

    assert_eq!(root.get(), (1, 0));
}

#[test]
fn thread_change_to_current_worker_is_elided() {
    let system = test_system(2);

    let root = Coro::new(async {
        resume_on(0).await;
        thread_index().expect("off-worker")
    })
    .with_affinity(0);

    system.schedule(&root);
    spin_until(|| root.is_finished(), SPIN_TIMEOUT);

    assert_eq!(root.get(), 0);
    // No queue round-trip happened: the only submission is the initial one.
    assert_eq!(system.handle().tracker.submits(), 1);
}

#[test]
fn continuation_runs_after_whole_subtree() {
    let system = test_system(2);

    let children_done = Arc::new(AtomicUsize::new(0));
    let continuation_saw_children = Arc::new(AtomicBool::new(false));
    let continuation_ran = Arc::new(AtomicBool::new(false));

    let continuation = {
        let children_done = Arc::clone(&children_done);
        let saw = Arc::clone(&continuation_saw_children);
        let ran = Arc::clone(&continuation_ran);
        func(move || {
            saw.store(children_done.load(Ordering::SeqCst) == 3, Ordering::SeqCst);
            ran.store(true, Ordering::SeqCst);
        })
    };

    let job = {
        let children_done = Arc::clone(&children_done);
        func(move || {
            for _ in 0..3 {
                let children_done = Arc::clone(&children_done);
                crate::schedule(func(move || {
                    std::thread::sleep(Duration::from_millis(1));
                    children_done.fetch_add(1, Ordering::SeqCst);
                }));
            }
        })
        .continue_with(continuation)
    };

    // Awaiting the job hands its continuation to the awaiter: the outer
    // coroutine may not resume before the continuation ran.
    let outer = Coro::new(async move {
        all(job).await;
    });

    system.schedule(&outer);
    spin_until(|| outer.is_finished(), SPIN_TIMEOUT);

    assert!(continuation_ran.load(Ordering::SeqCst));
    assert!(continuation_saw_children.load(Ordering::SeqCst));
}

#[test]
fn dropping_future_before_completion_leaks_nothing() {
    let alloc = Arc::new(CountingAlloc::default());
    let system = test_system(2);

    let gate = Arc::new(AtomicBool::new(false));
    let coro = {
        let gate = Arc::clone(&gate);
        Coro::new_in(
            async move {
                while !gate.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                7
            },
            alloc.clone(),
        )
    };

    system.schedule(&coro);
    drop(coro);
    assert_eq!(alloc.live(), 1);

    // Unblock the job; the scheduler's share is the last one and frees the
    // frame at completion.
    gate.store(true, Ordering::Release);
    spin_until(|| alloc.live() == 0, SPIN_TIMEOUT);
    assert_eq!(alloc.allocated(), 1);
}

#[test]
fn dropping_unscheduled_coroutine_frees_frame() {
    let alloc = Arc::new(CountingAlloc::default());
    let coro = Coro::new_in(async { 1 }, alloc.clone());
    assert_eq!(alloc.live(), 1);
    drop(coro);
    assert_eq!(alloc.live(), 0);
}

#[test]
fn structured_completion_covers_grandchildren() {
    let system = test_system(2);
    let flag = Arc::new(AtomicBool::new(false));

    let outer = {
        let flag = Arc::clone(&flag);
        Coro::new(async move {
            all(func(move || {
                let flag = Arc::clone(&flag);
                crate::schedule(func(move || {
                    std::thread::sleep(Duration::from_millis(1));
                    flag.store(true, Ordering::SeqCst);
                }));
            }))
            .await;
        })
    };

    system.schedule(&outer);
    spin_until(|| outer.is_finished(), SPIN_TIMEOUT);

    // The outer coroutine resumed only after the grandchild finished.
    assert!(flag.load(Ordering::SeqCst));
}

#[test]
fn tuple_await_collects_heterogeneous_children() {
    let system = test_system(2);
    let effects = Arc::new(AtomicUsize::new(0));

    let root = {
        let effects = Arc::clone(&effects);
        Coro::new(async move {
            let values: Vec<Coro<i32>> = (0..3).map(|i| Coro::new(async move { i })).collect();
            let jobs: Vec<FnJob> = (0..2)
                .map(|_| {
                    let effects = Arc::clone(&effects);
                    func(move || {
                        effects.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();

            let (values, _) = all((values, jobs)).await;
            values.into_iter().sum::<i32>()
        })
    };

    system.schedule(&root);
    spin_until(|| root.is_finished(), SPIN_TIMEOUT);

    assert_eq!(root.get(), 3);
    assert_eq!(effects.load(Ordering::SeqCst), 2);
}

#[test]
fn empty_container_await_is_a_no_op() {
    let system = test_system(2);

    let root = Coro::new(async { all(Vec::<Coro<i32>>::new()).await.len() });
    system.schedule(&root);
    spin_until(|| root.is_finished(), SPIN_TIMEOUT);

    assert_eq!(root.get(), 0);
    // The empty await never suspended: one submission, no resume.
    assert_eq!(system.handle().tracker.submits(), 1);
}

#[test]
fn schedule_after_terminate_drops_silently() {
    let alloc = Arc::new(CountingAlloc::default());
    let system = test_system(1);

    system.terminate();
    system.wait_for_termination();

    let coro = Coro::new_in(async { 1 }, alloc.clone());
    system.schedule(&coro);

    assert!(!coro.is_finished());
    drop(coro);
    assert_eq!(alloc.live(), 0);
}

#[test]
fn teardown_destroys_suspended_subtrees() {
    let alloc = Arc::new(CountingAlloc::default());
    let system = test_system(1);

    // The first child to run tears the system down; its queued siblings
    // never execute and the suspended parent never resumes.
    let children: Vec<Coro<()>> = (0..3)
        .map(|_| {
            Coro::new_in(
                async {
                    crate::terminate();
                },
                alloc.clone(),
            )
        })
        .collect();
    let parent = Coro::new_in(
        async move {
            all(children).await;
        },
        alloc.clone(),
    );

    system.schedule(&parent);
    system.wait_for_termination();

    drop(parent);
    assert_eq!(alloc.live(), 0);
}

#[test]
fn caller_thread_can_serve_as_worker_zero() {
    let system = Builder::new()
        .worker_threads(2)
        .caller_runs_worker_zero()
        .try_build()
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let seen = Arc::clone(&seen);
        system.schedule(
            func(move || {
                seen.store(thread_index().expect("off-worker"), Ordering::SeqCst);
                crate::terminate();
            })
            .with_affinity(0),
        );
    }

    // Blocks until the job above terminates the system.
    system.run_caller_worker();
    system.wait_for_termination();

    assert_eq!(seen.load(Ordering::SeqCst), 0);
}

#[test]
fn singleton_is_first_call_wins() {
    let first = crate::init(Builder::new().worker_threads(1)).unwrap();
    let again = crate::instance();
    assert!(Arc::ptr_eq(&first, &again));

    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = Arc::clone(&ran);
        crate::schedule(func(move || ran.store(true, Ordering::SeqCst)));
    }
    spin_until(|| ran.load(Ordering::SeqCst), SPIN_TIMEOUT);

    crate::terminate();
    crate::wait_for_termination();
    drop(first);
    drop(again);
    crate::reset_instance();
}

#[test]
#[should_panic(expected = "job scheduled twice")]
fn double_schedule_is_rejected() {
    let system = test_system(1);
    let coro = Coro::new(async { 1 });
    system.schedule(&coro);
    system.schedule(&coro);
}

#[test]
#[should_panic(expected = "read before completion")]
fn get_before_completion_is_rejected() {
    let coro: Coro<i32> = Coro::new(async { 1 });
    let _ = coro.get();
}

#[test]
fn off_worker_queries_return_none() {
    assert_eq!(thread_index(), None);
    assert!(crate::current_job().is_none());
}

#[test]
fn job_metadata_reaches_the_running_body() {
    let system = test_system(1);
    let seen = Arc::new(AtomicUsize::new(0));

    {
        let seen = Arc::clone(&seen);
        system.schedule(
            func(move || {
                let token = crate::current_job().expect("no current job");
                assert_eq!(token.kind(), crate::Kind::Function);
                seen.store(token.tag().unwrap() as usize, Ordering::SeqCst);
            })
            .with_tag(42)
            .with_trace_id(7),
        );
    }

    spin_until(|| seen.load(Ordering::SeqCst) == 42, SPIN_TIMEOUT);
}
