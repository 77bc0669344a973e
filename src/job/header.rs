use crate::job::raw::Vtable;
use bitflags::bitflags;
use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU8, Ordering};

/// Affinity value meaning "any worker may run this job".
pub const ANY_WORKER: i32 = -1;

/// Informational tags carried by every job and forwarded to the trace sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tags {
    pub ty: i32,
    pub id: i32,
}

impl Tags {
    pub const NONE: Tags = Tags { ty: -1, id: -1 };

    pub fn new(ty: i32, id: i32) -> Tags {
        Tags { ty, id }
    }
}

impl Default for Tags {
    fn default() -> Tags {
        Tags::NONE
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct JobFlags: u8 {
        /// The cell behind this header is a coroutine promise.
        const CORO = 1 << 0;
        /// The body ran to completion during the last slice.
        const FINALIZED = 1 << 1;
        /// The last slice ended at a yield point.
        const YIELDED = 1 << 2;
        /// The job has been handed to a scheduler at least once.
        const SUBMITTED = 1 << 3;
        /// The protocol already gave up its ownership share.
        const RELEASED = 1 << 4;
    }
}

/// Atomically mutable run-state bits.
pub(crate) struct RunState(AtomicU8);

impl RunState {
    fn new(flags: JobFlags) -> RunState {
        RunState(AtomicU8::new(flags.bits()))
    }

    pub(crate) fn load(&self) -> JobFlags {
        JobFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn contains(&self, flags: JobFlags) -> bool {
        self.load().contains(flags)
    }

    pub(crate) fn insert(&self, flags: JobFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove(&self, flags: JobFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Sets `flags` and reports whether they were all already set.
    pub(crate) fn test_and_insert(&self, flags: JobFlags) -> bool {
        let prev = JobFlags::from_bits_retain(self.0.fetch_or(flags.bits(), Ordering::AcqRel));
        prev.contains(flags)
    }
}

/// The universal scheduling node. Every cell, plain callable or coroutine
/// promise, starts with one of these so the queues and the completion
/// protocol stay oblivious to the concrete body type.
pub(crate) struct Header {
    /// Intrusive queue link. Owned by the queue while the job is enqueued.
    pub(crate) next: AtomicPtr<Header>,

    /// Outstanding work in this job's subtree, the job itself included.
    /// The slice wrapper resets it to 1, every scheduled child adds one,
    /// and the last decrement triggers the completion protocol.
    pub(crate) children: AtomicI32,

    /// Job that scheduled this one. Never owned: the parent's own children
    /// counter keeps it alive for as long as this job may signal it.
    parent: AtomicPtr<Header>,

    /// Successor scheduled once the whole subtree has completed. A fresh
    /// coroutine promise points this at itself, which is what resumes the
    /// coroutine when a suspension slice drains its children.
    continuation: AtomicPtr<Header>,

    /// Worker this job insists on; [`ANY_WORKER`] means no preference.
    pub(crate) affinity: Cell<i32>,

    /// Trace tags. Purely informational.
    pub(crate) tags: Cell<Tags>,

    /// Run-state bits.
    pub(crate) flags: RunState,

    /// Dispatch table of the concrete cell behind this header.
    pub(crate) vtable: &'static Vtable,
}

// Safety: the `Cell` fields are only written by the thread that currently
// owns the job (the submitter before hand-off, the running worker during a
// slice). Ownership moves between threads through the queue head CAS and
// the children counter, both of which carry acquire/release edges.
unsafe impl Send for Header {}
unsafe impl Sync for Header {}

impl Header {
    pub(crate) fn new(vtable: &'static Vtable, flags: JobFlags) -> Header {
        Header {
            next: AtomicPtr::new(ptr::null_mut()),
            children: AtomicI32::new(1),
            parent: AtomicPtr::new(ptr::null_mut()),
            continuation: AtomicPtr::new(ptr::null_mut()),
            affinity: Cell::new(ANY_WORKER),
            tags: Cell::new(Tags::NONE),
            flags: RunState::new(flags),
            vtable,
        }
    }

    pub(crate) fn parent(&self) -> Option<NonNull<Header>> {
        NonNull::new(self.parent.load(Ordering::Acquire))
    }

    pub(crate) fn set_parent(&self, parent: Option<NonNull<Header>>) {
        self.parent.store(
            parent.map_or(ptr::null_mut(), NonNull::as_ptr),
            Ordering::Release,
        );
    }

    pub(crate) fn continuation(&self) -> Option<NonNull<Header>> {
        NonNull::new(self.continuation.load(Ordering::Acquire))
    }

    pub(crate) fn set_continuation(&self, continuation: Option<NonNull<Header>>) {
        self.continuation.store(
            continuation.map_or(ptr::null_mut(), NonNull::as_ptr),
            Ordering::Release,
        );
    }

    /// Adds `n` outstanding children. Callers must hold the job alive, which
    /// in practice means the counter is still at least 1 (the self count).
    pub(crate) fn add_children(&self, n: i32) {
        let prev = self.children.fetch_add(n, Ordering::AcqRel);
        debug_assert!(prev >= 1, "children counter revived from {prev}");
    }

    pub(crate) fn is_coroutine(&self) -> bool {
        self.flags.contains(JobFlags::CORO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_bit_ops() {
        let state = RunState::new(JobFlags::CORO);
        assert!(state.contains(JobFlags::CORO));
        assert!(!state.contains(JobFlags::FINALIZED));

        state.insert(JobFlags::YIELDED);
        assert!(state.contains(JobFlags::CORO | JobFlags::YIELDED));

        state.remove(JobFlags::YIELDED);
        assert!(!state.contains(JobFlags::YIELDED));

        assert!(!state.test_and_insert(JobFlags::RELEASED));
        assert!(state.test_and_insert(JobFlags::RELEASED));
    }

    #[test]
    fn default_tags_are_untyped() {
        assert_eq!(Tags::default(), Tags { ty: -1, id: -1 });
    }
}
