//! Lock-free intrusive job queues.
//!
//! Jobs link through the `next` pointer in their own header, so a queue is
//! just one atomic head. Pushing prepends with a CAS from any thread. The
//! LIFO flavor also pops at the head with a CAS and tolerates any number
//! of consumers. The FIFO flavor walks to the tail and detaches it, which
//! is only sound with a single consumer: the walked suffix is untouched by
//! producers, who only ever prepend. With one element left the FIFO pop
//! degenerates to the head CAS.
//!
//! No ABA guard: a job re-enters a queue only after it was popped, ran a
//! full slice and went through the completion protocol, so a stale head
//! observed by a CAS loop can no longer be re-pushed concurrently. The
//! same contract covers the pop race on the multi-consumer variant, where
//! a loser may still read the `next` link of a node the winner already
//! took before the failing CAS makes the loser reload.

use crate::job::{Header, RawJob};
use crossbeam_utils::CachePadded;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

pub(crate) struct JobQueue<const FIFO: bool> {
    head: CachePadded<AtomicPtr<Header>>,
}

/// Per-worker queue: multi-producer, popped only by the owning worker.
pub(crate) type LocalQueue = JobQueue<true>;

/// Stealable queue: multi-producer, multi-consumer, LIFO.
pub(crate) type GlobalQueue = JobQueue<false>;

// Safety: all shared mutation goes through the atomic head and the atomic
// `next` links; the FIFO tail walk is protected by the single-consumer
// contract documented above.
unsafe impl<const FIFO: bool> Send for JobQueue<FIFO> {}
unsafe impl<const FIFO: bool> Sync for JobQueue<FIFO> {}

impl<const FIFO: bool> JobQueue<FIFO> {
    pub(crate) const fn new() -> JobQueue<FIFO> {
        JobQueue {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Prepends a job. Wait-free apart from CAS retries; never blocks.
    pub(crate) fn push(&self, job: RawJob) {
        let node = job.header_ptr().as_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: until the CAS succeeds the node is ours alone.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Removes a job, or `None` when empty.
    pub(crate) fn pop(&self) -> Option<RawJob> {
        let head = self.head.load(Ordering::Acquire);
        if head.is_null() {
            return None;
        }

        if FIFO {
            // Safety: single consumer. Producers only prepend, so every
            // node past the loaded head is reachable by us alone.
            unsafe {
                let mut last = head;
                let mut cursor = (*head).next.load(Ordering::Acquire);
                if !cursor.is_null() {
                    while !(*cursor).next.load(Ordering::Acquire).is_null() {
                        last = cursor;
                        cursor = (*cursor).next.load(Ordering::Acquire);
                    }
                    (*last).next.store(ptr::null_mut(), Ordering::Release);
                    return Some(RawJob::from_header(NonNull::new_unchecked(cursor)));
                }
            }
        }

        // LIFO, or a single element left in a FIFO queue: CAS the head
        // forward, racing producers and (for LIFO) other consumers.
        let mut head = head;
        while !head.is_null() {
            // Safety: `head` was observed in the queue; per the no-recycle
            // contract it stays valid while we race for it.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Some(RawJob::from_header(unsafe { NonNull::new_unchecked(head) }));
                }
                Err(observed) => head = observed,
            }
        }
        None
    }

    /// Pops until empty. Used at teardown.
    pub(crate) fn drain(&self) -> impl Iterator<Item = RawJob> + '_ {
        std::iter::from_fn(move || self.pop())
    }
}
