//! A cooperative job system for game-style workloads.
//!
//! `jobble` runs two kinds of work on a fixed pool of OS threads:
//!
//! - **function jobs** ([`func`]) - one-shot closures that run to completion
//!   on a worker;
//! - **coroutine jobs** ([`Coro`]) - futures that suspend on the completion
//!   of child work ([`all`], or awaiting a child directly) or hop between
//!   workers ([`resume_on`]), resumed by the scheduler once their children
//!   finish.
//!
//! Both share one counting discipline: every job carries a fan-in counter
//! covering its own body and every child it spawns, and a parent is
//! complete only once its whole subtree is. Completion - not wakers -
//! drives resumption, which keeps the hot path at a handful of atomic
//! operations per job.
//!
//! Workers prefer their own queue (populated by affinity-pinned jobs) and
//! fall back to a shared queue; there is no work stealing and no
//! preemption.
//!
//! ```no_run
//! use jobble::{Builder, Coro, all};
//!
//! fn sum_tree() -> Coro<i64> {
//!     Coro::new(async {
//!         let children: Vec<Coro<i64>> = (0..8).map(|i| Coro::new(async move { i })).collect();
//!         all(children).await.into_iter().sum()
//!     })
//! }
//!
//! let system = Builder::new().worker_threads(2).try_build().unwrap();
//! let root = sum_tree();
//! system.schedule(&root);
//! while !root.is_finished() {
//!     std::thread::yield_now();
//! }
//! assert_eq!(root.get(), 28);
//! ```

pub mod alloc;
pub use alloc::{FrameAlloc, GlobalFrameAlloc};

mod awaitable;
pub use awaitable::{AwaitChildren, AwaitSet, ResumeOn, all, resume_on};

pub(crate) mod context;
pub use context::{JobToken, current_job, thread_index};

pub mod job;
pub use job::{Continuation, Coro, FnJob, Kind, func};

pub(crate) mod queue;

pub mod runtime;
pub use runtime::{
    Builder, JobSystem, Schedulable, init, instance, schedule, terminate, wait_for_termination,
};

#[doc(hidden)]
pub use runtime::reset_instance;

#[cfg(test)]
pub(crate) mod test_utils;
