//! Suspension points usable inside coroutine bodies.
//!
//! Every awaiter follows the same two-phase shape: the first poll does the
//! work (schedule children, stash a yielded value, request a worker hop)
//! and suspends; the completion protocol brings the promise back for the
//! second poll, which resolves. Wakers are deliberately ignored.

use crate::context;
use crate::coro::cell::CoroShared;
use crate::job::{Header, JobFlags};
use crate::runtime::{Schedulable, SubmitCtx};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

/// Schedules every job in `set` as a child of the current coroutine and
/// suspends until all of them (and their subtrees) have completed. An
/// empty set resolves immediately without suspending.
///
/// `set` is borrowed, not consumed: once `join` resolves, coroutine results
/// are claimed from the handles still sitting in the set.
///
/// ```no_run
/// # async fn demo() {
/// let mut batch = vec![magpie::coro(async { 1 }), magpie::coro(async { 2 })];
/// magpie::join(&mut batch).await;
/// let total: i32 = batch.iter().map(|c| c.take().unwrap()).sum();
/// # }
/// ```
pub fn join<S: Schedulable>(set: &mut S) -> Join<'_, S> {
    Join {
        set,
        submitted: false,
    }
}

pub struct Join<'a, S: Schedulable> {
    set: &'a mut S,
    submitted: bool,
}

impl<S: Schedulable> Future for Join<'_, S> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.submitted {
            return Poll::Ready(());
        }

        let count = this.set.count();
        if count == 0 {
            return Poll::Ready(());
        }

        let parent = context::current_job().expect("join can only be awaited inside a running job");
        // All increments land before the first child is enqueued, so no
        // child's completion can collapse the counter early.
        parent.header().add_children(count as i32);
        context::with_handle(|handle| {
            this.set.submit(SubmitCtx {
                parent: Some(parent.header_ptr()),
                handle,
            })
        });
        this.submitted = true;

        Poll::Pending
    }
}

/// Moves the current coroutine to worker `worker`. Resolves immediately if
/// it is already running there; out-of-range targets fall back to any
/// worker.
pub fn resume_on(worker: i32) -> ResumeOn {
    ResumeOn {
        target: worker,
        parked: false,
    }
}

pub struct ResumeOn {
    target: i32,
    parked: bool,
}

impl Future for ResumeOn {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if context::thread_index() == this.target {
            return Poll::Ready(());
        }
        if !this.parked {
            let job = context::current_job()
                .expect("resume_on can only be awaited inside a running job");
            job.header().affinity.set(this.target);
            this.parked = true;
            return Poll::Pending;
        }
        // Rescheduled but not on the requested worker: the target was
        // clamped to "any", so hopping again would spin forever.
        Poll::Ready(())
    }
}

/// Producer-side yield handle passed into a generator body by
/// [`generator`](crate::generator).
pub struct Yielder<T> {
    ptr: NonNull<Header>,
    _p: PhantomData<fn(T) -> T>,
}

// Safety: a Yielder is only usable from inside its own generator's body,
// which runs on one worker at a time.
unsafe impl<T: Send> Send for Yielder<T> {}
unsafe impl<T: Send> Sync for Yielder<T> {}

impl<T> Clone for Yielder<T> {
    fn clone(&self) -> Self {
        Yielder {
            ptr: self.ptr,
            _p: PhantomData,
        }
    }
}

impl<T: Send + 'static> Yielder<T> {
    pub(crate) fn new(ptr: NonNull<Header>) -> Yielder<T> {
        Yielder {
            ptr,
            _p: PhantomData,
        }
    }

    fn shared(&self) -> &CoroShared<T> {
        // Safety: the generator body (which owns this Yielder) cannot
        // outlive its own cell.
        unsafe { self.ptr.cast::<CoroShared<T>>().as_ref() }
    }

    /// Publishes `value` to the awaiting consumer and suspends without
    /// finalizing. The generator stays dormant until awaited again.
    pub fn yield_value(&self, value: T) -> YieldValue<'_, T> {
        YieldValue {
            yielder: self,
            value: Some(value),
        }
    }
}

pub struct YieldValue<'a, T> {
    yielder: &'a Yielder<T>,
    value: Option<T>,
}

impl<T: Send + 'static> Future for YieldValue<'_, T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        // Safety: YieldValue has no self-referential fields; it is never
        // relied on for address stability.
        let this = unsafe { self.get_unchecked_mut() };
        match this.value.take() {
            Some(value) => {
                let shared = this.yielder.shared();
                // Flag first: the slice wrapper checks it to route the
                // suspension down the yield path.
                shared.core.header.flags.insert(JobFlags::YIELDED);
                shared.result.put(value);
                Poll::Pending
            }
            None => {
                // Re-driven by the next await of the generator handle.
                this.yielder
                    .shared()
                    .core
                    .header
                    .flags
                    .remove(JobFlags::YIELDED);
                Poll::Ready(())
            }
        }
    }
}
