//! Coroutines: suspendable computations whose promise is itself a job.

mod awaiter;
pub use awaiter::{Join, ResumeOn, YieldValue, Yielder, join, resume_on};

pub(crate) mod cell;

mod future;
pub use future::{Coro, coro, generator};
