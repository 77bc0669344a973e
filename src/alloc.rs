//! Pluggable allocation for job cells.
//!
//! Every job cell (plain callable or coroutine promise) is carved out of an
//! allocator chosen at scheduler construction time. The allocator that
//! produced an allocation is stashed in a trailing slot of the allocation
//! itself, so deallocation can recover it without a global registry and
//! without the cell type carrying an allocator handle around.

use parking_lot::Mutex;
use std::alloc::Layout;
use std::process;
use std::ptr::NonNull;
use std::sync::Arc;

/// A thread-safe source of raw memory for job cells.
///
/// Implementations must be safe to call concurrently from every worker.
/// Returning null from [`allocate`](JobAllocator::allocate) is treated as
/// fatal by the scheduler: a job system that cannot allocate a cell cannot
/// make progress.
pub trait JobAllocator: Send + Sync {
    fn allocate(&self, layout: Layout) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on the same allocator
    /// with the same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout);
}

/// The process allocator, used when nothing else is configured.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl JobAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> *mut u8 {
        debug_assert!(layout.size() > 0);
        unsafe { std::alloc::alloc(layout) }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr, layout) }
    }
}

/// Block alignment served by the pool. Requests with a stricter alignment
/// fall through to the system allocator.
const BLOCK_ALIGN: usize = 64;

/// Blocks retained per size class before excess is returned to the system.
const MAX_RETAINED: usize = 32;

const CLASS_SIZES: [usize; 6] = [64, 256, 1024, 4096, 16384, 65536];

struct PoolClass {
    size: usize,
    free: Mutex<Vec<NonNull<u8>>>,
}

// Safety: the raw pointers in the free list reference blocks that no other
// thread can observe until they are popped again under the same lock.
unsafe impl Send for PoolClass {}
unsafe impl Sync for PoolClass {}

/// A synchronized, size-classed pool over the system allocator.
///
/// Frees are retained per class and handed back on the next allocation of a
/// compatible size, which keeps promise-frame churn off the system
/// allocator's hot path. Oversized or over-aligned requests bypass the pool.
pub struct PooledAllocator {
    classes: Box<[PoolClass]>,
}

impl PooledAllocator {
    pub fn new() -> PooledAllocator {
        PooledAllocator {
            classes: CLASS_SIZES
                .iter()
                .map(|&size| PoolClass {
                    size,
                    free: Mutex::new(Vec::new()),
                })
                .collect(),
        }
    }

    fn class_for(&self, layout: &Layout) -> Option<&PoolClass> {
        if layout.align() > BLOCK_ALIGN {
            return None;
        }
        self.classes.iter().find(|c| c.size >= layout.size())
    }

    fn block_layout(size: usize) -> Layout {
        Layout::from_size_align(size, BLOCK_ALIGN).expect("invalid pool block layout")
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl JobAllocator for PooledAllocator {
    fn allocate(&self, layout: Layout) -> *mut u8 {
        match self.class_for(&layout) {
            Some(class) => {
                if let Some(block) = class.free.lock().pop() {
                    return block.as_ptr();
                }
                unsafe { std::alloc::alloc(Self::block_layout(class.size)) }
            }
            None => unsafe { std::alloc::alloc(layout) },
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        match self.class_for(&layout) {
            Some(class) => {
                let mut free = class.free.lock();
                if free.len() < MAX_RETAINED {
                    // Safety: allocate never hands out null.
                    free.push(unsafe { NonNull::new_unchecked(ptr) });
                } else {
                    drop(free);
                    unsafe { std::alloc::dealloc(ptr, Self::block_layout(class.size)) }
                }
            }
            None => unsafe { std::alloc::dealloc(ptr, layout) },
        }
    }
}

impl Drop for PooledAllocator {
    fn drop(&mut self) {
        for class in self.classes.iter() {
            let layout = Self::block_layout(class.size);
            for block in class.free.lock().drain(..) {
                unsafe { std::alloc::dealloc(block.as_ptr(), layout) }
            }
        }
    }
}

/// Layout of a cell of type `C` plus the trailing allocator slot, and the
/// slot's byte offset from the start of the allocation.
fn cell_layout<C>() -> (Layout, usize) {
    let (layout, offset) = Layout::new::<C>()
        .extend(Layout::new::<*const dyn JobAllocator>())
        .expect("cell layout overflow");
    (layout.pad_to_align(), offset)
}

/// Moves `cell` into memory obtained from `allocator` and records the
/// allocator in the trailing slot. Aborts the process on allocation failure.
pub(crate) fn allocate_cell<C>(allocator: &Arc<dyn JobAllocator>, cell: C) -> NonNull<C> {
    let (layout, slot) = cell_layout::<C>();
    let raw = allocator.allocate(layout);
    if raw.is_null() {
        oom(layout);
    }
    unsafe {
        raw.cast::<C>().write(cell);
        raw.add(slot)
            .cast::<*const dyn JobAllocator>()
            .write(Arc::into_raw(Arc::clone(allocator)));
        NonNull::new_unchecked(raw.cast::<C>())
    }
}

/// Drops the cell and returns its memory to the allocator recorded in the
/// trailing slot.
///
/// # Safety
///
/// `ptr` must have come from [`allocate_cell::<C>`] and must not be used
/// afterwards.
pub(crate) unsafe fn deallocate_cell<C>(ptr: NonNull<C>) {
    let (layout, slot) = cell_layout::<C>();
    let base = ptr.as_ptr().cast::<u8>();
    unsafe {
        let allocator = Arc::from_raw(base.add(slot).cast::<*const dyn JobAllocator>().read());
        std::ptr::drop_in_place(ptr.as_ptr());
        allocator.deallocate(base, layout);
    }
}

#[cold]
fn oom(layout: Layout) -> ! {
    eprintln!("magpie: job allocator returned null for {layout:?}, aborting");
    process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicBool, Ordering};

    assert_impl_all!(SystemAllocator: Send, Sync);
    assert_impl_all!(PooledAllocator: Send, Sync);

    #[test]
    fn system_round_trip() {
        let alloc = SystemAllocator;
        let layout = Layout::from_size_align(128, 16).unwrap();
        let ptr = alloc.allocate(layout);
        assert!(!ptr.is_null());
        unsafe { alloc.deallocate(ptr, layout) };
    }

    #[test]
    fn pool_reuses_freed_blocks() {
        let alloc = PooledAllocator::new();
        let layout = Layout::from_size_align(200, 8).unwrap();
        let first = alloc.allocate(layout);
        assert!(!first.is_null());
        unsafe { alloc.deallocate(first, layout) };
        // Same class, compatible size: the pool must hand the block back.
        let second = alloc.allocate(Layout::from_size_align(240, 8).unwrap());
        assert_eq!(first, second);
        unsafe { alloc.deallocate(second, Layout::from_size_align(240, 8).unwrap()) };
    }

    #[test]
    fn oversized_requests_bypass_the_pool() {
        let alloc = PooledAllocator::new();
        let layout = Layout::from_size_align(1 << 20, 8).unwrap();
        let ptr = alloc.allocate(layout);
        assert!(!ptr.is_null());
        unsafe { alloc.deallocate(ptr, layout) };
    }

    #[test]
    fn trailing_slot_recovers_the_producing_allocator() {
        struct Probe(Arc<AtomicBool>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.store(true, Ordering::Release);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let allocator: Arc<dyn JobAllocator> = Arc::new(PooledAllocator::new());
        let ptr = allocate_cell(&allocator, Probe(dropped.clone()));
        assert!(!dropped.load(Ordering::Acquire));
        unsafe { deallocate_cell(ptr) };
        assert!(dropped.load(Ordering::Acquire));
    }
}
