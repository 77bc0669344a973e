//! The coroutine promise cell.
//!
//! A promise is a job record first: the scheduler enqueues and runs it like
//! any callable. One "slice" polls the wrapped state machine until it either
//! suspends (an awaiter already scheduled the children that will bring it
//! back), yields (generators), or completes.
//!
//! Layout is `#[repr(C)]` with the header first, like the callable cell,
//! and with the result slot at a `T`-determined offset so the consumer
//! handle can reach it without knowing the state-machine type. The slot
//! lives beside the state machine, not inside it, which is what lets a
//! consumer read the value after the producer finalized and dropped its
//! stage.

use crate::alloc::{self, JobAllocator};
use crate::job::{Header, JobFlags, Vtable};
use futures::task::noop_waker_ref;
use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::task::{Context, Poll};

/// The type-independent prefix of every promise cell.
#[repr(C)]
pub(crate) struct PromiseCore {
    pub(crate) header: Header,

    /// Job that was current when this promise was submitted. Becomes the
    /// job-record parent only at the final suspension point, so ordinary
    /// children count against the live body rather than the final join.
    coro_parent: AtomicPtr<Header>,

    /// Ownership shares: one for the running promise, one for the consumer
    /// handle. Whoever drops the last share destroys the cell.
    handles: AtomicU8,
}

/// Result storage shared between producer and consumer.
pub(crate) struct ResultSlot<T> {
    ready: AtomicBool,
    value: UnsafeCell<Option<T>>,
}

impl<T> ResultSlot<T> {
    fn new() -> ResultSlot<T> {
        ResultSlot {
            ready: AtomicBool::new(false),
            value: UnsafeCell::new(None),
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Producer side: store a value and publish it.
    pub(crate) fn put(&self, value: T) {
        // Safety: only the running slice writes, and it cannot race itself.
        unsafe { *self.value.get() = Some(value) };
        self.ready.store(true, Ordering::Release);
    }

    /// Consumer side: claim the value, clearing the slot.
    pub(crate) fn take(&self) -> Option<T> {
        if self.ready.swap(false, Ordering::AcqRel) {
            // Safety: the swap above makes us the unique claimant.
            unsafe { (*self.value.get()).take() }
        } else {
            None
        }
    }

    /// Consumer side: copy the value out without clearing readiness.
    pub(crate) fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        if self.is_ready() {
            // Safety: a ready slot is not written again until taken.
            unsafe { (*self.value.get()).clone() }
        } else {
            None
        }
    }
}

/// The prefix visible to a `Coro<T>` handle: core plus the typed slot.
#[repr(C)]
pub(crate) struct CoroShared<T> {
    pub(crate) core: PromiseCore,
    pub(crate) result: ResultSlot<T>,
}

enum Stage<F> {
    /// Placeholder while the cell is being wired up.
    Empty,
    Running(F),
    Consumed,
}

/// The full cell. Only the `run`/`dealloc` vtable entries know `F`.
#[repr(C)]
pub(crate) struct CoroCell<T, F> {
    shared: CoroShared<T>,
    stage: UnsafeCell<Stage<F>>,
}

/// Allocates a promise cell around the state machine produced by `make`,
/// which receives the cell's own header pointer (generators thread it into
/// their yield handle). The fresh promise suspends immediately: it is not
/// scheduled, and its continuation points at itself.
pub(crate) fn allocate<T, F>(
    make: impl FnOnce(NonNull<Header>) -> F,
    allocator: &Arc<dyn JobAllocator>,
) -> NonNull<Header>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let cell = CoroCell::<T, F> {
        shared: CoroShared {
            core: PromiseCore {
                header: Header::new(vtable::<T, F>(), JobFlags::CORO),
                coro_parent: AtomicPtr::new(ptr::null_mut()),
                handles: AtomicU8::new(2),
            },
            result: ResultSlot::new(),
        },
        stage: UnsafeCell::new(Stage::Empty),
    };

    let ptr = alloc::allocate_cell(allocator, cell);
    let header = ptr.cast::<Header>();
    unsafe {
        header.as_ref().set_continuation(Some(header));
        *ptr.as_ref().stage.get() = Stage::Running(make(header));
    }
    header
}

/// Records the job that is submitting this promise.
///
/// # Safety
///
/// `ptr` must point at a live promise cell.
pub(crate) unsafe fn set_coro_parent(ptr: NonNull<Header>, parent: Option<NonNull<Header>>) {
    let core = unsafe { ptr.cast::<PromiseCore>().as_ref() };
    core.coro_parent.store(
        parent.map_or(ptr::null_mut(), NonNull::as_ptr),
        Ordering::Release,
    );
}

/// Drops one ownership share; the last share destroys the cell.
///
/// # Safety
///
/// The caller must own the share it is dropping.
pub(crate) unsafe fn release_share(ptr: NonNull<Header>) {
    let core = unsafe { ptr.cast::<PromiseCore>().as_ref() };
    if core.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
        // Safety: we just observed the last share; nobody else can reach
        // the cell anymore.
        unsafe { (ptr.as_ref().vtable.dealloc)(ptr) };
    }
}

fn vtable<T, F>() -> &'static Vtable
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    &Vtable {
        run: run::<T, F>,
        release: release_promise_share,
        shutdown: release_promise_share,
        dealloc: dealloc::<T, F>,
    }
}

/// Polls the state machine for one slice.
unsafe fn run<T, F>(ptr: NonNull<Header>)
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let cell = unsafe { ptr.cast::<CoroCell<T, F>>().as_ref() };
    let header = &cell.shared.core.header;

    let poll = {
        // Safety: the running worker has exclusive access to the stage.
        let stage = unsafe { &mut *cell.stage.get() };
        let Stage::Running(future) = stage else {
            // Already finalized; a stray resubmission has nothing to do.
            return;
        };
        // Safety: the cell is heap-allocated and never moves.
        let future = unsafe { Pin::new_unchecked(future) };
        let mut cx = Context::from_waker(noop_waker_ref());
        crate::job::abort_on_panic(move || future.poll(&mut cx))
    };

    match poll {
        Poll::Ready(value) => {
            // Drop the state machine before publishing: nothing may
            // resume a finalized frame.
            unsafe { *cell.stage.get() = Stage::Consumed };
            cell.shared.result.put(value);

            header.set_continuation(None);
            // A promise handed off as a continuation already carries the
            // parent it inherited from its predecessor; that join must
            // survive finalization. Otherwise attach the submitting job.
            if header.parent().is_none() {
                let coro_parent =
                    NonNull::new(cell.shared.core.coro_parent.load(Ordering::Acquire));
                header.set_parent(coro_parent);
            }
            header.flags.insert(JobFlags::FINALIZED);
        }
        Poll::Pending => {
            if header.flags.contains(JobFlags::YIELDED) {
                // A yield notifies the awaiting job like a completion,
                // without finalizing. The protocol detaches the parent
                // again before the generator goes dormant.
                let coro_parent =
                    NonNull::new(cell.shared.core.coro_parent.load(Ordering::Acquire));
                header.set_parent(coro_parent);
            }
            // Plain suspension: an awaiter scheduled children that will
            // collapse the counter and resubmit us via the
            // self-continuation.
        }
    }
}

/// Protocol-side release of a finalized promise. Guarded so a stray
/// resubmission of a finalized cell cannot double-release.
unsafe fn release_promise_share(ptr: NonNull<Header>) {
    let already = unsafe { ptr.as_ref() }.flags.test_and_insert(JobFlags::RELEASED);
    if !already {
        unsafe { release_share(ptr) };
    }
}

unsafe fn dealloc<T, F>(ptr: NonNull<Header>)
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    unsafe { alloc::deallocate_cell(ptr.cast::<CoroCell<T, F>>()) }
}
