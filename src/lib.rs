//! A work-stealing job system for compute-heavy workloads.
//!
//! Two kinds of units run under one roof: plain callables ([`Task`]) and
//! suspendable computations ([`Coro`], built from ordinary futures). Both
//! are jobs in the same parent/child tree: a job does not finish until
//! every child it scheduled has, joins are non-blocking, and a
//! [`continuation`] runs only after its predecessor's whole subtree is
//! done.
//!
//! Workers pull from their own queue first and steal from the global
//! queues when idle. Coroutines suspend at awaits and are brought back by
//! the completion protocol itself, so there are no wakers to lose and no
//! threads blocked on joins.
//!
//! ```no_run
//! use magpie::Task;
//!
//! fn compute(i: i32) -> magpie::Coro<i32> {
//!     magpie::coro(async move { 2 * i })
//! }
//!
//! magpie::schedule(Task::new(|| {
//!     let answer = magpie::coro(async {
//!         let mut batch = vec![compute(3), compute(4)];
//!         magpie::join(&mut batch).await;
//!         batch.iter().map(|c| c.take().unwrap()).sum::<i32>()
//!     });
//!     magpie::schedule(&answer);
//!     magpie::continuation(Task::new(move || {
//!         println!("sum = {}", answer.take().unwrap());
//!         magpie::terminate();
//!     }));
//! }));
//! ```

pub mod alloc;
pub use alloc::{JobAllocator, PooledAllocator, SystemAllocator};

mod context;

pub mod coro;
pub use coro::{Coro, Join, ResumeOn, YieldValue, Yielder, coro, generator, join, resume_on};

pub mod job;
pub use job::{ANY_WORKER, JobRef, RawJob, Tags, Task};

pub mod runtime;
pub use runtime::{Builder, Handle, IntoJob, Schedulable, Scheduler, SubmitCtx};

pub mod trace;
pub use trace::TraceError;

use anyhow::Result;

/// The process-wide job system, created with default configuration on
/// first use. Use [`Builder::install`] to configure it instead.
pub fn instance() -> Handle {
    Builder::new().install()
}

/// Submits a unit to the scheduler reachable from this thread. Inside a
/// running job the unit's jobs become children of it.
pub fn schedule<S: Schedulable>(unit: S) {
    context::with_handle(|h| h.schedule(unit));
}

/// Submits a unit with no parent: the explicit way to break the
/// parent/child relation. The current job's completion no longer waits on
/// the unit's subtree.
pub fn schedule_detached<S: Schedulable>(unit: S) {
    context::with_handle(|h| h.schedule_detached(unit));
}

/// Installs the continuation of the current job. Silently ignored outside
/// a running plain callable; only the first install in a job sticks.
pub fn continuation<U: IntoJob>(unit: U) {
    context::with_handle(|h| h.continuation(unit));
}

/// Asks every worker to exit its loop.
pub fn terminate() {
    context::with_handle(|h| h.terminate());
}

/// Joins the worker threads of the scheduler reachable from this thread.
/// Call [`terminate`] first.
pub fn wait_for_termination() -> Result<()> {
    context::with_handle(|h| h.wait_for_termination())
}

/// Drives worker `index` on the calling thread until termination. See
/// [`Builder::start_index`].
pub fn thread_task(index: usize) {
    context::with_handle(|h| h.clone()).thread_task(index);
}

/// Index of the worker running the current thread, or [`ANY_WORKER`]
/// outside the pool.
pub fn thread_index() -> i32 {
    context::thread_index()
}

/// The job executing on this thread, if any.
pub fn current_job() -> Option<JobRef> {
    context::current_job().map(JobRef::new)
}
