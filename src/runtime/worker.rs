use crate::context;
use crate::job::RawJob;
use crate::job::protocol;
use crate::runtime::Handle;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// The worker loop. Runs on a pool thread, or on the caller's thread via
/// `thread_task`.
pub(crate) fn run(handle: Handle, index: usize) {
    context::init_worker(handle.clone(), index);
    tracing::debug!(worker = index, "worker online");

    // Hold every worker at the gate until the whole pool is present, so no
    // job can observe a half-started pool. Termination lifts the gate too:
    // a dormant worker 0 may never be driven.
    handle.pending_workers.fetch_sub(1, Ordering::AcqRel);
    while handle.pending_workers.load(Ordering::Acquire) > 0
        && !handle.terminate.load(Ordering::Acquire)
    {
        thread::sleep(Duration::from_nanos(100));
    }

    let mut idle = 0u32;
    while !handle.terminate.load(Ordering::Acquire) {
        let job = handle
            .local(index)
            .pop()
            .or_else(|| handle.pop_global(index));

        match job {
            Some(job) => {
                idle = 0;
                run_one(&handle, index, job);
            }
            None => {
                idle += 1;
                // Worker 0 stays hot: a cooperating main-thread driver
                // must remain responsive.
                if idle >= handle.cfg.idle_spins && index > 0 {
                    idle = 0;
                    thread::sleep(handle.cfg.idle_sleep);
                }
            }
        }
    }

    tracing::debug!(worker = index, "worker offline");
}

fn run_one(handle: &Handle, index: usize, job: RawJob) {
    if !handle.trace.enabled() {
        protocol::execute(job);
        return;
    }

    // The header may be gone once the slice completes; read tags first.
    let tags = job.header().tags.get();
    let begin = handle.trace.now();
    protocol::execute(job);
    handle.trace.record(index, begin, handle.trace.now(), tags);
}
