//! The completion protocol: how a finished slice ripples through the
//! parent/child tree, hands off continuations and resumes coroutines.
//!
//! A job counts itself among its own children. The slice wrapper resets the
//! counter to 1 before running the body; everything the body schedules adds
//! one; the wrapper's final decrement drops the self count. Whoever makes
//! the counter hit zero, the wrapper or the last finishing child, drives
//! [`on_finished`]. The self count is what keeps a parent from finishing in
//! the window between scheduling two children.

use crate::context;
use crate::job::header::JobFlags;
use crate::job::raw::RawJob;
use std::sync::atomic::Ordering;

/// Runs one slice of `job` on the current thread and settles the counter.
pub(crate) fn execute(job: RawJob) {
    let header = job.header();
    header.children.store(1, Ordering::Release);

    {
        let _enter = context::enter_job(job);
        // Safety: a popped job has exactly one executor.
        unsafe { job.run() };
    }

    if header.children.fetch_sub(1, Ordering::AcqRel) == 1 {
        on_finished(job);
    }
}

/// A job's subtree has fully completed. Must be called exactly once per
/// counter collapse; the counter protocol guarantees that.
pub(crate) fn on_finished(job: RawJob) {
    let header = job.header();
    // Snapshot everything up front: some branches below republish the job,
    // after which the header belongs to another worker.
    let flags = header.flags.load();
    let parent = header.parent().map(RawJob::from_header);

    if flags.contains(JobFlags::CORO) && !flags.intersects(JobFlags::FINALIZED | JobFlags::YIELDED)
    {
        // Suspended coroutine: its continuation points at itself, so
        // draining the children means the body is ready for its next
        // slice. Nothing may touch the header past this schedule.
        context::with_handle(|h| h.schedule_raw(job));
        return;
    }

    if flags.contains(JobFlags::YIELDED) {
        // Dormant generator. Detach from the awaiting job before notifying
        // it: the notification may re-submit this cell immediately.
        header.set_parent(None);
        if let Some(parent) = parent {
            child_finished(parent);
        }
        return;
    }

    if let Some(cont) = header.continuation().map(RawJob::from_header) {
        if let Some(parent) = parent {
            // The continuation joins the parent's subtree in our place.
            parent.header().add_children(1);
            cont.header().set_parent(Some(parent.header_ptr()));
        }
        context::with_handle(|h| h.schedule_raw(cont));
    }

    if let Some(parent) = parent {
        child_finished(parent);
    }

    // Safety: the job finalized and this is the single protocol-side
    // release point.
    unsafe { job.release() };
}

/// One child of `parent` has fully completed.
pub(crate) fn child_finished(parent: RawJob) {
    let prev = parent.header().children.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev >= 1, "child signalled a settled parent");
    if prev == 1 {
        on_finished(parent);
    }
}

/// Reclaims a job that was drained from a queue at teardown. Cascades into
/// an installed continuation, which would otherwise never be scheduled.
pub(crate) fn reclaim(job: RawJob) {
    if let Some(cont) = job.header().continuation() {
        // A coroutine's continuation is itself; don't chase that cycle.
        if cont != job.header_ptr() {
            reclaim(RawJob::from_header(cont));
        }
    }
    // Safety: drained jobs have no executor and are never requeued.
    unsafe { job.shutdown() };
}
