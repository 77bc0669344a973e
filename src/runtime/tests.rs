use crate::job::Task;
use crate::runtime::{Builder, Handle};
use crate::{Yielder, coro, generator};
use crossbeam_channel::bounded;
use rstest::rstest;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn build(workers: usize) -> Handle {
    Builder::new()
        .worker_threads(workers)
        .trace_path(temp_path("unused"))
        .build()
}

fn shutdown(handle: &Handle) {
    handle.terminate();
    handle.wait_for_termination().unwrap();
}

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("magpie-{}-{}.json", tag, std::process::id()))
}

fn compute(i: i32) -> crate::Coro<i32> {
    coro(async move { 2 * i })
}

#[rstest]
#[case::small(8)]
#[case::large(64)]
fn independent_callables_run_exactly_once(#[case] n: usize) {
    let handle = build(2);
    let executed = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = bounded(n);

    for i in 0..n {
        let executed = executed.clone();
        let tx = tx.clone();
        handle.schedule(Task::new(move || {
            executed.fetch_add(1, Ordering::Relaxed);
            tx.send(i).unwrap();
        }));
    }

    let mut seen: Vec<usize> = (0..n).map(|_| rx.recv_timeout(RECV_TIMEOUT).unwrap()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..n).collect::<Vec<_>>());
    assert_eq!(executed.load(Ordering::Relaxed), n);

    shutdown(&handle);
}

#[test]
fn continuation_runs_after_the_whole_subtree() {
    let handle = build(3);
    let counter = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = bounded(1);

    fn fan_out(depth: u32, counter: Arc<AtomicUsize>) {
        counter.fetch_add(1, Ordering::Relaxed);
        if depth > 0 {
            for _ in 0..4 {
                let counter = counter.clone();
                crate::schedule(Task::new(move || fan_out(depth - 1, counter)));
            }
        }
    }

    {
        let counter = counter.clone();
        handle.schedule(Task::new(move || {
            fan_out(2, counter.clone());
            let counter = counter.clone();
            crate::continuation(Task::new(move || {
                tx.send(counter.load(Ordering::Relaxed)).unwrap();
            }));
        }));
    }

    // The continuation joins the root's subtree: every descendant must
    // have run before it.
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), 21);
    shutdown(&handle);
}

#[test]
fn coroutine_chain_propagates_the_result() {
    let handle = build(2);
    let (tx, rx) = bounded(1);

    handle.schedule(Task::new(move || {
        let root = coro(async move {
            let stage = coro(async move { compute(6).await });
            stage.await
        })
        .with(crate::ANY_WORKER, 2, 1);
        crate::schedule(&root);
        crate::continuation(Task::new(move || {
            tx.send(root.take()).unwrap();
        }));
    }));

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Some(12));
    shutdown(&handle);
}

#[test]
fn tuple_await_joins_heterogeneous_collections() {
    let handle = build(3);
    let (tx, rx) = bounded(1);

    handle.schedule(Task::new(move || {
        let driver = coro(async move {
            let mut batch = (
                vec![compute(1), compute(2)],
                vec![coro(async { 0.5f32 }), coro(async { 1.0f32 })],
            );
            crate::join(&mut batch).await;

            let ints: i32 = batch.0.iter().map(|c| c.take().unwrap()).sum();
            let floats: f32 = batch.1.iter().map(|c| c.take().unwrap()).sum();
            (ints, floats)
        });
        crate::schedule(&driver);
        crate::continuation(Task::new(move || {
            tx.send(driver.take()).unwrap();
        }));
    }));

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Some((6, 1.5)));
    shutdown(&handle);
}

#[test]
fn empty_collections_resolve_without_suspending() {
    let handle = build(2);
    let (tx, rx) = bounded(1);

    handle.schedule(Task::new(move || {
        let driver = coro(async move {
            let mut nothing: Vec<crate::Coro<i32>> = Vec::new();
            crate::join(&mut nothing).await;
            7
        });
        crate::schedule(&driver);
        crate::continuation(Task::new(move || tx.send(driver.take()).unwrap()));
    }));

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Some(7));
    shutdown(&handle);
}

#[test]
fn resume_on_moves_the_coroutine_to_the_target_worker() {
    let handle = build(2);
    let (tx, rx) = bounded(1);

    handle.schedule(Task::new(move || {
        let driver = coro(async move {
            let before = crate::thread_index();
            crate::resume_on(0).await;
            let after = crate::thread_index();
            (before, after)
        });
        crate::schedule(&driver);
        crate::continuation(Task::new(move || tx.send(driver.take()).unwrap()));
    }));

    let (before, after) = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert!(before == 0 || before == 1);
    assert_eq!(after, 0);
    shutdown(&handle);
}

#[test]
fn detached_jobs_do_not_join_the_callers_subtree() {
    let handle = build(2);
    let (tx_counts, rx_counts) = bounded(1);
    let (tx_orphan, rx_orphan) = bounded(1);
    let (tx_cont, rx_cont) = bounded(1);

    handle.schedule(Task::new(move || {
        let me = crate::current_job().unwrap();
        let before = me.pending_children();
        crate::schedule_detached(Task::new(move || {
            std::thread::sleep(Duration::from_millis(100));
            tx_orphan.send(Instant::now()).unwrap();
        }));
        let after = me.pending_children();
        tx_counts.send((before, after)).unwrap();

        crate::continuation(Task::new(move || {
            tx_cont.send(Instant::now()).unwrap();
        }));
    }));

    let (before, after) = rx_counts.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(before, after, "detached submission must not touch the parent");

    // The continuation does not wait for the orphan.
    let cont_at = rx_cont.recv_timeout(RECV_TIMEOUT).unwrap();
    let orphan_at = rx_orphan.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(cont_at < orphan_at);

    shutdown(&handle);
}

#[test]
fn coroutine_continuation_joins_the_predecessors_parent() {
    let handle = build(2);
    let (tx, rx) = bounded(1);
    let flag = Arc::new(AtomicBool::new(false));

    {
        let flag = flag.clone();
        handle.schedule(Task::new(move || {
            let inner_flag = flag.clone();
            crate::schedule(Task::new(move || {
                crate::continuation(coro(async move {
                    inner_flag.store(true, Ordering::Release);
                }));
            }));
            crate::continuation(Task::new(move || {
                tx.send(flag.load(Ordering::Acquire)).unwrap();
            }));
        }));
    }

    // The inner job's coroutine continuation joins the outer job's
    // subtree: the outer continuation fires only after it finalized, and
    // must observe its effect.
    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    shutdown(&handle);
}

#[test]
fn only_the_first_continuation_is_installed() {
    let handle = build(2);
    let (tx, rx) = bounded(1);
    let second_ran = Arc::new(AtomicBool::new(false));

    {
        let second_ran = second_ran.clone();
        handle.schedule(Task::new(move || {
            crate::continuation(Task::new(move || tx.send(()).unwrap()));
            crate::continuation(coro(async move {
                second_ran.store(true, Ordering::Release);
            }));
        }));
    }

    rx.recv_timeout(RECV_TIMEOUT).unwrap();
    // The losing unit was dropped without being installed.
    std::thread::sleep(Duration::from_millis(100));
    assert!(!second_ran.load(Ordering::Acquire));
    shutdown(&handle);
}

#[test]
fn generator_yields_then_finishes() {
    let handle = build(2);
    let (tx, rx) = bounded(1);
    let dropped = Arc::new(AtomicBool::new(false));

    struct Probe(Arc<AtomicBool>);
    impl Drop for Probe {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    {
        let dropped = dropped.clone();
        handle.schedule(Task::new(move || {
            let probe = Probe(dropped.clone());
            let mut squares = generator(|y: Yielder<i32>| async move {
                let _probe = probe;
                for i in 0..5 {
                    y.yield_value(i * i).await;
                }
                -1
            });

            let driver = coro(async move {
                let mut seen = Vec::new();
                for _ in 0..5 {
                    seen.push((&mut squares).await);
                }
                // Dormant between awaits, but the frame must still be live.
                let alive_between_awaits = !dropped.load(Ordering::Acquire);
                let last = (&mut squares).await;
                (seen, alive_between_awaits, last)
            });
            crate::schedule(&driver);
            crate::continuation(Task::new(move || tx.send(driver.take()).unwrap()));
        }));
    }

    let (seen, alive_between_awaits, last) = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(seen, vec![0, 1, 4, 9, 16]);
    assert!(alive_between_awaits);
    assert_eq!(last, -1);
    shutdown(&handle);
}

#[test]
fn scheduled_coroutine_result_is_polled_through_the_handle() {
    let handle = build(2);
    let answer = compute(21);
    handle.schedule(&answer);

    let deadline = Instant::now() + RECV_TIMEOUT;
    while !answer.ready() {
        assert!(Instant::now() < deadline, "coroutine never completed");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(answer.take(), Some(42));
    assert_eq!(answer.take(), None);

    shutdown(&handle);
}

#[test]
fn trace_orders_parent_end_before_continuation_begin() {
    let handle = build(2);
    let (tx, rx) = bounded(1);
    handle.enable_logging();
    handle.name_type(1, "parent");

    handle.schedule(
        Task::new(move || {
            for i in 0..5 {
                crate::schedule(Task::new(|| {}).tags(2, i));
            }
            crate::continuation(Task::new(move || tx.send(()).unwrap()).tags(3, 0));
        })
        .tags(1, 0),
    );

    rx.recv_timeout(RECV_TIMEOUT).unwrap();

    // The continuation's span lands just after it signals; poll for it.
    let deadline = Instant::now() + RECV_TIMEOUT;
    let spans = loop {
        let spans = handle.trace.spans();
        if spans.iter().any(|s| s.tags.ty == 3) {
            break spans;
        }
        assert!(Instant::now() < deadline, "continuation span never recorded");
        std::thread::sleep(Duration::from_millis(1));
    };

    let parent = spans.iter().find(|s| s.tags.ty == 1).unwrap();
    let cont = spans.iter().find(|s| s.tags.ty == 3).unwrap();
    let mut child_ids: Vec<i32> = spans.iter().filter(|s| s.tags.ty == 2).map(|s| s.tags.id).collect();
    child_ids.sort_unstable();

    assert_eq!(child_ids, vec![0, 1, 2, 3, 4]);
    assert!(parent.end_us <= cont.begin_us);

    let path = temp_path("flush");
    let flushed = Builder::new()
        .worker_threads(1)
        .trace_path(&path)
        .build();
    flushed.enable_logging();
    shutdown(&handle);

    // Disable writes the Chrome-tracing file even with nothing recorded.
    flushed.disable_logging().unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(parsed["traceEvents"].is_array());
    shutdown(&flushed);
    std::fs::remove_file(path).ok();
}

#[test]
fn main_thread_drives_worker_zero() {
    let handle = Builder::new()
        .worker_threads(2)
        .start_index(1)
        .trace_path(temp_path("driver"))
        .build();
    let (tx, rx) = bounded(1);

    handle.schedule(
        Task::new(move || {
            tx.send(crate::thread_index()).unwrap();
            crate::terminate();
        })
        .affinity(0),
    );

    // Blocks until the job above calls terminate.
    handle.thread_task(0);

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), 0);
    handle.wait_for_termination().unwrap();
}

#[test]
fn termination_is_idempotent() {
    let handle = build(2);
    handle.terminate();
    handle.terminate();
    handle.wait_for_termination().unwrap();
    handle.wait_for_termination().unwrap();
}

#[test]
fn queued_jobs_are_reclaimed_at_teardown() {
    let handle = build(1);
    handle.terminate();
    handle.wait_for_termination().unwrap();

    // The pool is gone; these can never run and must still be reclaimed.
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let ran = ran.clone();
        handle.schedule(Task::new(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        }));
    }
    let orphaned = compute(1);
    handle.schedule(&orphaned);
    drop(orphaned);

    // The second wait drains the queues: jobs are reclaimed, not run.
    handle.wait_for_termination().unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 0);
}

#[test]
fn process_wide_instance_backs_the_free_functions() {
    let installed = Builder::new()
        .worker_threads(2)
        .trace_path(temp_path("global"))
        .install();
    assert_eq!(installed.worker_count(), 2);

    let (tx, rx) = bounded(1);
    crate::schedule(Task::new(move || tx.send(crate::thread_index()).unwrap()));
    let index = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(index >= 0 && index < 2);

    // A second install keeps the first configuration.
    let again = Builder::new().worker_threads(7).install();
    assert_eq!(again.worker_count(), 2);

    crate::terminate();
    crate::wait_for_termination().unwrap();
}
