//! Submission shaping: the units that can be handed to the scheduler.

use crate::coro::Coro;
use crate::coro::cell;
use crate::job::{Header, RawJob, Task};
use crate::runtime::Handle;
use std::mem;
use std::ptr::NonNull;

/// Submission context handed to [`Schedulable::submit`]. Opaque to users.
#[derive(Clone, Copy)]
pub struct SubmitCtx<'a> {
    pub(crate) parent: Option<NonNull<Header>>,
    pub(crate) handle: &'a Handle,
}

/// A unit the scheduler can take: a shaped callable, a coroutine handle, a
/// homogeneous collection of either, or a tuple of such collections.
///
/// Implementations bind each job to the context's parent and enqueue it.
/// Child accounting on the parent is the caller's responsibility and is
/// completed before `submit` runs, so a child finishing early can never
/// collapse the parent's counter while siblings are still being enqueued.
pub trait Schedulable {
    /// Number of jobs this unit expands to.
    fn count(&self) -> usize;

    /// Hands every job to the scheduler.
    fn submit(&mut self, ctx: SubmitCtx<'_>);
}

impl<F: FnOnce() + Send + 'static> Schedulable for Task<F> {
    fn count(&self) -> usize {
        self.is_armed() as usize
    }

    fn submit(&mut self, ctx: SubmitCtx<'_>) {
        if let Some(job) = self.take_cell(ctx.handle.allocator()) {
            job.header().set_parent(ctx.parent);
            ctx.handle.schedule_raw(job);
        }
    }
}

impl<T: Send + 'static> Schedulable for Coro<T> {
    fn count(&self) -> usize {
        1
    }

    fn submit(&mut self, ctx: SubmitCtx<'_>) {
        self.bind(ctx.parent);
        ctx.handle.schedule_raw(self.raw());
    }
}

/// Submits the coroutine while the caller keeps the handle, the usual way
/// to schedule work whose result is read later.
impl<T: Send + 'static> Schedulable for &Coro<T> {
    fn count(&self) -> usize {
        1
    }

    fn submit(&mut self, ctx: SubmitCtx<'_>) {
        self.bind(ctx.parent);
        ctx.handle.schedule_raw(self.raw());
    }
}

impl<S: Schedulable> Schedulable for Vec<S> {
    fn count(&self) -> usize {
        self.iter().map(Schedulable::count).sum()
    }

    fn submit(&mut self, ctx: SubmitCtx<'_>) {
        for unit in self.iter_mut() {
            unit.submit(ctx);
        }
    }
}

macro_rules! impl_schedulable_tuple {
    ($(($($name:ident : $idx:tt),+))+) => {$(
        impl<$($name: Schedulable),+> Schedulable for ($($name,)+) {
            fn count(&self) -> usize {
                0 $(+ self.$idx.count())+
            }

            fn submit(&mut self, ctx: SubmitCtx<'_>) {
                $(self.$idx.submit(ctx);)+
            }
        }
    )+};
}

impl_schedulable_tuple! {
    (A: 0)
    (A: 0, B: 1)
    (A: 0, B: 1, C: 2)
    (A: 0, B: 1, C: 2, D: 3)
}

/// A unit that can become a single job: what [`continuation`] accepts.
///
/// [`continuation`]: crate::continuation
pub trait IntoJob {
    #[doc(hidden)]
    fn into_job(self, handle: &Handle) -> Option<RawJob>;
}

impl<F: FnOnce() + Send + 'static> IntoJob for Task<F> {
    fn into_job(mut self, handle: &Handle) -> Option<RawJob> {
        self.take_cell(handle.allocator())
    }
}

impl<T: Send + 'static> IntoJob for Coro<T> {
    fn into_job(self, _handle: &Handle) -> Option<RawJob> {
        let raw = self.raw();
        // The continuation slot takes over the consumer share: the handle
        // must not have been submitted before, and its result can no
        // longer be observed.
        // Safety: we forget `self` below, so its share is released exactly
        // once, here.
        unsafe { cell::release_share(raw.header_ptr()) };
        mem::forget(self);
        Some(raw)
    }
}
