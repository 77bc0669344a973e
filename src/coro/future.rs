use crate::context;
use crate::coro::cell::{self, CoroShared};
use crate::coro::Yielder;
use crate::job::{Header, JobFlags, RawJob, Tags};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

/// Creates a suspended coroutine from a future.
///
/// The coroutine does not start executing until it is submitted, either by
/// [`schedule`](crate::schedule) or by awaiting the returned handle inside
/// another job.
///
/// ```no_run
/// fn compute(i: i32) -> magpie::Coro<i32> {
///     magpie::coro(async move { 2 * i })
/// }
/// ```
pub fn coro<T, F>(future: F) -> Coro<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let allocator = context::current_allocator();
    Coro::from_header(cell::allocate::<T, F>(|_| future, &allocator))
}

/// Creates a suspended generator: a coroutine that may yield repeatedly
/// through the [`Yielder`] passed to its body before finally returning.
///
/// ```no_run
/// let squares = magpie::generator(|y: magpie::Yielder<i32>| async move {
///     for i in 0..5 {
///         y.yield_value(i * i).await;
///     }
///     -1
/// });
/// ```
pub fn generator<T, F, Fut>(body: F) -> Coro<T>
where
    T: Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    F: FnOnce(Yielder<T>) -> Fut,
{
    let allocator = context::current_allocator();
    Coro::from_header(cell::allocate::<T, Fut>(
        |header| body(Yielder::new(header)),
        &allocator,
    ))
}

/// Consumer handle to a coroutine: the future side of the promise.
///
/// Awaiting the handle inside a running job schedules the coroutine as a
/// child and resolves to its returned (or next yielded) value. A handle
/// submitted with [`schedule`](crate::schedule) is polled for its value
/// with [`take`](Coro::take) or [`get`](Coro::get) instead.
///
/// The frame is jointly owned by this handle and the running promise; the
/// stored result stays readable even after the producer finalized, and the
/// last owner frees the frame.
pub struct Coro<T> {
    ptr: NonNull<Header>,
    scheduled: bool,
    _p: PhantomData<T>,
}

// Safety: the handle only touches the result slot (atomically published)
// and the ownership count; the cell itself is managed by the scheduler.
unsafe impl<T: Send> Send for Coro<T> {}

impl<T: Send + 'static> Coro<T> {
    pub(crate) fn from_header(ptr: NonNull<Header>) -> Coro<T> {
        Coro {
            ptr,
            scheduled: false,
            _p: PhantomData,
        }
    }

    fn shared(&self) -> &CoroShared<T> {
        // Safety: the handle holds an ownership share, and CoroShared is a
        // repr(C) prefix of the cell.
        unsafe { self.ptr.cast::<CoroShared<T>>().as_ref() }
    }

    pub(crate) fn raw(&self) -> RawJob {
        RawJob::from_header(self.ptr)
    }

    pub(crate) fn bind(&self, parent: Option<NonNull<Header>>) {
        // Safety: the cell is live for as long as the handle is.
        unsafe { cell::set_coro_parent(self.ptr, parent) };
    }

    /// Sets the `(affinity, type, id)` triple before submission.
    pub fn with(self, affinity: i32, ty: i32, id: i32) -> Self {
        let header = self.raw();
        header.header().affinity.set(affinity);
        header.header().tags.set(Tags::new(ty, id));
        self
    }

    /// Whether a value (returned or yielded) is waiting in the slot.
    pub fn ready(&self) -> bool {
        self.shared().result.is_ready()
    }

    /// Claims the stored value, leaving the slot empty.
    pub fn take(&self) -> Option<T> {
        self.shared().result.take()
    }

    /// Copies the stored value out, leaving the slot ready.
    pub fn get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.shared().result.peek()
    }
}

impl<T: Send + 'static> Future for Coro<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        // Safety: Coro has no self-referential fields (only a raw pointer,
        // a bool, and a PhantomData<T>); it is never relied on for address
        // stability.
        let this = unsafe { self.get_unchecked_mut() };

        if let Some(value) = this.shared().result.take() {
            // Ready for this await cycle; a generator may be awaited again.
            this.scheduled = false;
            return Poll::Ready(value);
        }

        if !this.scheduled {
            if this.raw().header().flags.contains(JobFlags::FINALIZED) {
                panic!("Coro awaited after completion");
            }
            let parent = context::current_job()
                .expect("a Coro can only be awaited inside a running job");
            this.bind(Some(parent.header_ptr()));
            // The increment must land before the child can signal back.
            parent.header().add_children(1);
            this.scheduled = true;
            context::with_handle(|h| h.schedule_raw(this.raw()));
        }

        Poll::Pending
    }
}

impl<T> Drop for Coro<T> {
    fn drop(&mut self) {
        // Safety: the handle owns one share; a never-submitted cell is
        // owned by the handle outright.
        unsafe {
            let header = self.ptr.as_ref();
            if header.flags.contains(JobFlags::SUBMITTED) {
                cell::release_share(self.ptr);
            } else {
                (header.vtable.dealloc)(self.ptr);
            }
        }
    }
}

impl<T> std::fmt::Debug for Coro<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coro").field("cell", &self.ptr).finish()
    }
}
