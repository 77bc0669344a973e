use crate::alloc::JobAllocator;
use crate::context;
use crate::job::protocol;
use crate::job::{JobFlags, RawJob};
use crate::runtime::queue::{GlobalQueue, LocalQueue};
use crate::runtime::spawn::{IntoJob, Schedulable, SubmitCtx};
use crate::runtime::{Config, worker};
use crate::trace::{TraceError, TraceSink};
use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

/// The job system: worker threads, their queues, and the termination
/// machinery. Constructed through [`Builder`](crate::Builder); all
/// interaction goes through a [`Handle`].
pub struct Scheduler {
    pub(crate) cfg: Config,

    /// One local queue per worker. Anyone pushes, only the owner pops.
    locals: Box<[LocalQueue]>,

    /// Stealable global queues, one per worker to spread contention.
    globals: Box<[GlobalQueue]>,

    pub(crate) terminate: AtomicBool,

    /// Startup countdown: workers spin here until the whole pool (the
    /// caller-driven worker 0 included) has entered its loop, so
    /// `thread_index` is valid before any job runs.
    pub(crate) pending_workers: AtomicI32,

    threads: Mutex<Vec<thread::JoinHandle<()>>>,

    allocator: Arc<dyn JobAllocator>,

    pub(crate) trace: TraceSink,
}

impl Scheduler {
    pub(crate) fn start(cfg: Config, allocator: Arc<dyn JobAllocator>) -> Handle {
        let n = cfg.worker_threads;
        let scheduler = Scheduler {
            locals: (0..n).map(|_| LocalQueue::new()).collect(),
            globals: (0..n).map(|_| GlobalQueue::new()).collect(),
            terminate: AtomicBool::new(false),
            pending_workers: AtomicI32::new(n as i32),
            threads: Mutex::new(Vec::new()),
            allocator,
            trace: TraceSink::new(n, cfg.trace_path.clone()),
            cfg,
        };
        let handle = Handle(Arc::new(scheduler));

        let mut threads = Vec::with_capacity(n - handle.cfg.start_index);
        for index in handle.cfg.start_index..n {
            let worker_handle = handle.clone();
            let name = format!("{}-{}", handle.cfg.thread_name, index);
            let thread = thread::Builder::new()
                .name(name)
                .spawn(move || worker::run(worker_handle, index))
                .expect("failed to spawn worker thread");
            threads.push(thread);
        }
        *handle.threads.lock() = threads;

        handle
    }

    pub fn worker_count(&self) -> usize {
        self.locals.len()
    }

    pub(crate) fn allocator(&self) -> &Arc<dyn JobAllocator> {
        &self.allocator
    }

    pub(crate) fn local(&self, index: usize) -> &LocalQueue {
        &self.locals[index]
    }

    /// Scans the global queues starting at the worker's own slot.
    pub(crate) fn pop_global(&self, index: usize) -> Option<RawJob> {
        let n = self.globals.len();
        (0..n).find_map(|k| self.globals[(index + k) % n].pop())
    }

    fn drain_queues(&self) {
        for queue in self.locals.iter() {
            for job in queue.drain() {
                protocol::reclaim(job);
            }
        }
        for queue in self.globals.iter() {
            for job in queue.drain() {
                protocol::reclaim(job);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.drain_queues();
        if let Err(error) = self.trace.flush_if_enabled() {
            tracing::warn!(%error, "failed to flush trace on teardown");
        }
    }
}

/// Cloneable reference to a [`Scheduler`].
#[derive(Clone)]
pub struct Handle(Arc<Scheduler>);

impl Deref for Handle {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.0
    }
}

impl Handle {
    /// Submits a unit. When called from inside a running job the unit's
    /// jobs become children of it: the caller's job does not finish until
    /// they do.
    pub fn schedule<S: Schedulable>(&self, unit: S) {
        self.schedule_with_parent(context::current_job(), unit);
    }

    /// Submits a unit with no parent, severing the join relation even when
    /// called from inside a running job.
    pub fn schedule_detached<S: Schedulable>(&self, unit: S) {
        self.schedule_with_parent(None, unit);
    }

    fn schedule_with_parent<S: Schedulable>(&self, parent: Option<RawJob>, mut unit: S) {
        let count = unit.count();
        if count == 0 {
            return;
        }
        if let Some(parent) = &parent {
            // All increments land before the first enqueue.
            parent.header().add_children(count as i32);
        }
        unit.submit(SubmitCtx {
            parent: parent.map(|p| p.header_ptr()),
            handle: self,
        });
    }

    /// Enqueues a single bound job: the local queue of the affinity worker,
    /// or a global queue picked to spread contention.
    pub(crate) fn schedule_raw(&self, job: RawJob) {
        let header = job.header();
        header.flags.insert(JobFlags::SUBMITTED);

        let affinity = header.affinity.get();
        let workers = self.locals.len() as i32;
        if (0..workers).contains(&affinity) {
            self.locals[affinity as usize].push(job);
        } else {
            self.globals[fastrand::usize(..self.globals.len())].push(job);
        }
    }

    /// Installs `unit` as the continuation of the current job: it is
    /// scheduled once the job's whole subtree completes, joining the
    /// job's parent in its place.
    ///
    /// Silently ignored outside a running plain callable; coroutines
    /// return their successor through their own body instead. A job has
    /// at most one continuation: the first install wins and later calls
    /// are dropped.
    pub fn continuation<U: IntoJob>(&self, unit: U) {
        let Some(current) = context::current_job() else {
            return;
        };
        if current.header().is_coroutine() {
            return;
        }
        // Refuse a second install before converting the unit, so the
        // loser is dropped without ever owning a cell.
        if current.header().continuation().is_some() {
            return;
        }
        if let Some(job) = unit.into_job(self) {
            current.header().set_continuation(Some(job.header_ptr()));
        }
    }

    /// Asks every worker to exit its loop. Jobs already running finish
    /// their current slice; queued jobs are reclaimed unrun at teardown.
    /// Idempotent.
    pub fn terminate(&self) {
        if !self.terminate.swap(true, Ordering::AcqRel) {
            tracing::debug!("termination requested");
        }
    }

    /// Joins the worker threads, reclaims whatever never ran and flushes
    /// the trace. Call [`terminate`](Handle::terminate) first. Idempotent:
    /// later calls have nothing left to join.
    pub fn wait_for_termination(&self) -> Result<()> {
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        let mut panicked = 0usize;
        for thread in threads {
            if thread.join().is_err() {
                panicked += 1;
            }
        }

        self.drain_queues();

        if let Err(error) = self.trace.flush_if_enabled() {
            tracing::warn!(%error, "failed to flush trace after termination");
        }

        if panicked > 0 {
            bail!("{panicked} worker thread(s) panicked");
        }
        Ok(())
    }

    /// Drives worker `index` on the calling thread until termination.
    ///
    /// Built with `start_index = 1`, the pool leaves worker 0 dormant for
    /// exactly this: frameworks that require certain work to run on the
    /// main thread park it here. The pool's startup barrier waits for
    /// every undriven worker, so a `start_index = 1` system schedules no
    /// jobs until the caller arrives.
    pub fn thread_task(&self, index: usize) {
        assert!(index < self.worker_count(), "worker index out of range");
        worker::run(self.clone(), index);
    }

    /// Starts recording begin/end events for every executed job.
    pub fn enable_logging(&self) {
        self.trace.enable();
    }

    /// Stops recording and writes the trace file.
    pub fn disable_logging(&self) -> Result<(), TraceError> {
        self.trace.disable()
    }

    /// Registers a display name for a tag `type`, used by the trace file.
    pub fn name_type(&self, ty: i32, name: impl Into<String>) {
        self.trace.name_type(ty, name);
    }
}

static GLOBAL: OnceLock<Handle> = OnceLock::new();

pub(crate) fn global() -> Option<&'static Handle> {
    GLOBAL.get()
}

pub(crate) fn install_global(make: impl FnOnce() -> Handle) -> Handle {
    GLOBAL.get_or_init(make).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Scheduler: Send, Sync);
    assert_impl_all!(Handle: Send, Sync, Clone);
    assert_impl_all!(crate::Coro<i32>: Send);
    assert_impl_all!(crate::Yielder<i32>: Send, Sync);
}
