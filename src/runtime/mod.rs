//! Scheduler construction and the worker pool.

use crate::alloc::{JobAllocator, SystemAllocator};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod queue;

pub(crate) mod scheduler;
pub use scheduler::{Handle, Scheduler};

mod spawn;
pub use spawn::{IntoJob, Schedulable, SubmitCtx};

pub(crate) mod worker;

#[cfg(test)]
mod tests;

/// Empty polls before an idle worker naps.
const DEFAULT_IDLE_SPINS: u32 = 20;

/// How long an idle worker naps.
const DEFAULT_IDLE_SLEEP: Duration = Duration::from_micros(5);

const DEFAULT_TRACE_PATH: &str = "log.json";

/// Resolved scheduler configuration.
#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) worker_threads: usize,
    pub(crate) start_index: usize,
    pub(crate) trace_path: PathBuf,
    pub(crate) idle_spins: u32,
    pub(crate) idle_sleep: Duration,
    pub(crate) thread_name: String,
}

/// Configures and starts a job system.
///
/// ```no_run
/// let handle = magpie::Builder::new().worker_threads(4).build();
/// ```
pub struct Builder {
    worker_threads: usize,
    start_index: usize,
    allocator: Option<Arc<dyn JobAllocator>>,
    trace_path: PathBuf,
    idle_spins: u32,
    idle_sleep: Duration,
    thread_name: String,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: 0,
            start_index: 0,
            allocator: None,
            trace_path: PathBuf::from(DEFAULT_TRACE_PATH),
            idle_spins: DEFAULT_IDLE_SPINS,
            idle_sleep: DEFAULT_IDLE_SLEEP,
            thread_name: "magpie-worker".to_string(),
        }
    }

    /// Number of workers. `0` (the default) means one per logical core.
    pub fn worker_threads(&mut self, n: usize) -> &mut Self {
        self.worker_threads = n;
        self
    }

    /// Index of the first worker the pool spawns a thread for. `1` leaves
    /// worker 0 dormant until the caller drives it with
    /// [`thread_task(0)`](Handle::thread_task), for frameworks that
    /// require main-thread execution.
    pub fn start_index(&mut self, index: usize) -> &mut Self {
        self.start_index = index;
        self
    }

    /// Allocator for job cells and coroutine frames. Defaults to the
    /// system allocator; see [`PooledAllocator`](crate::PooledAllocator).
    pub fn allocator(&mut self, allocator: Arc<dyn JobAllocator>) -> &mut Self {
        self.allocator = Some(allocator);
        self
    }

    /// Where the Chrome-tracing file is written. Defaults to `log.json`.
    pub fn trace_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.trace_path = path.into();
        self
    }

    /// Prefix for worker thread names.
    pub fn thread_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.thread_name = name.into();
        self
    }

    /// Tunes the idle backoff: `spins` empty polls, then a `sleep` nap.
    pub fn idle_policy(&mut self, spins: u32, sleep: Duration) -> &mut Self {
        self.idle_spins = spins.max(1);
        self.idle_sleep = sleep;
        self
    }

    /// Starts an independent job system and returns its handle.
    pub fn build(&mut self) -> Handle {
        let worker_threads = match self.worker_threads {
            0 => thread::available_parallelism().map_or(4, usize::from),
            n => n,
        };
        let cfg = Config {
            worker_threads,
            start_index: self.start_index.min(worker_threads),
            trace_path: self.trace_path.clone(),
            idle_spins: self.idle_spins,
            idle_sleep: self.idle_sleep,
            thread_name: self.thread_name.clone(),
        };
        let allocator = self
            .allocator
            .take()
            .unwrap_or_else(|| Arc::new(SystemAllocator));
        Scheduler::start(cfg, allocator)
    }

    /// Builds and installs the process-wide instance, or returns the
    /// existing one. The first caller's configuration wins.
    pub fn install(&mut self) -> Handle {
        scheduler::install_global(|| self.build())
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}
