//! Thread-local worker state.
//!
//! Each worker thread (and a caller driving worker 0 through
//! `thread_task`) binds itself to a scheduler once; the current-job pointer
//! is flipped at slice boundaries. Threads outside any worker fall back to
//! the installed process-wide scheduler.

use crate::alloc::{JobAllocator, SystemAllocator};
use crate::job::{ANY_WORKER, Header, RawJob};
use crate::runtime::Handle;
use std::cell::{Cell, OnceCell};
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

struct WorkerContext {
    handle: Handle,
    index: usize,
    current: Cell<Option<NonNull<Header>>>,
}

thread_local! {
    static CONTEXT: OnceCell<WorkerContext> = const { OnceCell::new() };
}

/// Binds the current thread to `handle` as worker `index`. A thread binds
/// at most once; later calls on the same thread are ignored.
pub(crate) fn init_worker(handle: Handle, index: usize) {
    CONTEXT.with(|ctx| {
        let _ = ctx.set(WorkerContext {
            handle,
            index,
            current: Cell::new(None),
        });
    });
}

/// Index of the worker bound to this thread, or [`ANY_WORKER`] outside the
/// pool.
pub(crate) fn thread_index() -> i32 {
    CONTEXT.with(|ctx| ctx.get().map_or(ANY_WORKER, |w| w.index as i32))
}

/// The job currently executing on this thread, if any.
pub(crate) fn current_job() -> Option<RawJob> {
    CONTEXT.with(|ctx| ctx.get().and_then(|w| w.current.get()))
        .map(RawJob::from_header)
}

/// Marks `job` as current for the duration of the returned guard.
pub(crate) fn enter_job(job: RawJob) -> EnterGuard {
    let prev = CONTEXT.with(|ctx| match ctx.get() {
        Some(worker) => worker.current.replace(Some(job.header_ptr())),
        None => None,
    });
    EnterGuard { prev }
}

pub(crate) struct EnterGuard {
    prev: Option<NonNull<Header>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CONTEXT.with(|ctx| {
            if let Some(worker) = ctx.get() {
                worker.current.set(self.prev);
            }
        });
    }
}

/// Runs `f` with the scheduler reachable from this thread: the worker's own
/// handle inside the pool, the process-wide instance elsewhere. Creates the
/// process-wide instance with default configuration if none exists yet.
pub(crate) fn with_handle<R>(f: impl FnOnce(&Handle) -> R) -> R {
    CONTEXT.with(|ctx| match ctx.get() {
        Some(worker) => f(&worker.handle),
        None => f(&crate::instance()),
    })
}

/// The allocator new cells should come from. Unlike [`with_handle`] this
/// never spins up a scheduler: off-pool threads without an installed
/// instance get the system allocator, and the trailing-slot scheme makes
/// any mix of allocators safe to tear down.
pub(crate) fn current_allocator() -> Arc<dyn JobAllocator> {
    static SYSTEM: OnceLock<Arc<dyn JobAllocator>> = OnceLock::new();

    CONTEXT.with(|ctx| ctx.get().map(|w| w.handle.allocator().clone()))
        .or_else(|| crate::runtime::scheduler::global().map(|h| h.allocator().clone()))
        .unwrap_or_else(|| SYSTEM.get_or_init(|| Arc::new(SystemAllocator)).clone())
}
