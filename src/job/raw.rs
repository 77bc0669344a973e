use crate::job::Header;
use std::ptr::NonNull;

/// Table of function pointers for the operations that need the concrete
/// cell type behind a [`Header`].
pub(crate) struct Vtable {
    /// Runs one execution slice of the job body.
    pub(crate) run: unsafe fn(NonNull<Header>),

    /// Releases the protocol's ownership share after the job finalized.
    pub(crate) release: unsafe fn(NonNull<Header>),

    /// Reclaims a job drained from a queue at teardown without running it.
    pub(crate) shutdown: unsafe fn(NonNull<Header>),

    /// Drops the cell and returns its memory to the allocator it came from.
    pub(crate) dealloc: unsafe fn(NonNull<Header>),
}

/// Type-erased handle to a job cell.
///
/// This is an internal pointer wrapper; it appears in a few public trait
/// signatures but exposes nothing. All operations dispatch through the
/// cell's vtable.
#[derive(Clone, Copy, Debug)]
pub struct RawJob {
    ptr: NonNull<Header>,
}

impl RawJob {
    pub(crate) fn from_header(ptr: NonNull<Header>) -> RawJob {
        RawJob { ptr }
    }

    pub(crate) fn header_ptr(&self) -> NonNull<Header> {
        self.ptr
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: a RawJob only exists while its cell is live; liveness is
        // guaranteed by the queue / children-counter ownership discipline.
        unsafe { self.ptr.as_ref() }
    }

    /// Safety: the caller must be the sole executor of this job.
    pub(crate) unsafe fn run(self) {
        unsafe { (self.header().vtable.run)(self.ptr) }
    }

    /// Safety: must be called exactly once, from the completion protocol,
    /// after the job finalized.
    pub(crate) unsafe fn release(self) {
        unsafe { (self.header().vtable.release)(self.ptr) }
    }

    /// Safety: the job must have been popped from a queue and must never
    /// run afterwards.
    pub(crate) unsafe fn shutdown(self) {
        unsafe { (self.header().vtable.shutdown)(self.ptr) }
    }
}
