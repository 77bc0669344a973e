use crate::alloc::{self, JobAllocator};
use crate::job::header::{ANY_WORKER, Header, JobFlags, Tags};
use crate::job::raw::{RawJob, Vtable};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Arc;

/// Cell backing a plain-callable job.
///
/// `Header` must stay the first field: queues and the completion protocol
/// address the cell through a `NonNull<Header>` pointing at its start.
#[repr(C)]
pub(crate) struct CallableCell<F> {
    header: Header,
    body: UnsafeCell<Option<F>>,
}

impl<F: FnOnce() + Send + 'static> CallableCell<F> {
    pub(crate) fn allocate(
        f: F,
        affinity: i32,
        tags: Tags,
        allocator: &Arc<dyn JobAllocator>,
    ) -> RawJob {
        let cell = CallableCell {
            header: Header::new(vtable::<F>(), JobFlags::empty()),
            body: UnsafeCell::new(Some(f)),
        };
        cell.header.affinity.set(affinity);
        cell.header.tags.set(tags);

        let ptr = alloc::allocate_cell(allocator, cell);
        RawJob::from_header(ptr.cast())
    }
}

fn vtable<F: FnOnce() + Send + 'static>() -> &'static Vtable {
    &Vtable {
        run: run::<F>,
        release: dealloc::<F>,
        shutdown: dealloc::<F>,
        dealloc: dealloc::<F>,
    }
}

unsafe fn run<F: FnOnce() + Send + 'static>(ptr: NonNull<Header>) {
    let cell = unsafe { ptr.cast::<CallableCell<F>>().as_ref() };
    // Safety: the running worker has exclusive access to the body.
    if let Some(body) = unsafe { (*cell.body.get()).take() } {
        crate::job::abort_on_panic(body);
    }
    cell.header.flags.insert(JobFlags::FINALIZED);
}

unsafe fn dealloc<F: FnOnce() + Send + 'static>(ptr: NonNull<Header>) {
    unsafe { alloc::deallocate_cell(ptr.cast::<CallableCell<F>>()) }
}

/// A plain callable shaped for submission: the closure plus the optional
/// `(affinity, type, id)` triple every schedulable unit may carry.
///
/// ```no_run
/// use magpie::Task;
///
/// magpie::schedule(Task::new(|| println!("hello")).affinity(0).tags(2, 7));
/// ```
pub struct Task<F> {
    body: Option<F>,
    affinity: i32,
    tags: Tags,
}

impl<F: FnOnce() + Send + 'static> Task<F> {
    pub fn new(f: F) -> Task<F> {
        Task {
            body: Some(f),
            affinity: ANY_WORKER,
            tags: Tags::NONE,
        }
    }

    /// Pins the task to a worker index. Out-of-range values fall back to
    /// any worker.
    pub fn affinity(mut self, worker: i32) -> Self {
        self.affinity = worker;
        self
    }

    pub fn tags(mut self, ty: i32, id: i32) -> Self {
        self.tags = Tags::new(ty, id);
        self
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.body.is_some()
    }

    pub(crate) fn take_cell(&mut self, allocator: &Arc<dyn JobAllocator>) -> Option<RawJob> {
        self.body
            .take()
            .map(|f| CallableCell::allocate(f, self.affinity, self.tags, allocator))
    }
}
