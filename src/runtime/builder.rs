use crate::alloc::{FrameAlloc, default_frame_alloc};
use crate::runtime::system::JobSystem;
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Consecutive empty polls before a worker considers sleeping.
const IDLE_SPINS: u32 = 20;

/// How long an idle worker sleeps between scans.
const IDLE_SLEEP: Duration = Duration::from_micros(5);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn(usize) -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    ThreadNameFn(Arc::new(|index| format!("jobble-worker-{index}")))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and starts a [`JobSystem`].
///
/// ```no_run
/// # use jobble::Builder;
/// let system = Builder::new().worker_threads(4).try_build().unwrap();
/// ```
pub struct Builder {
    /// The number of workers. Defaults to one per CPU core.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the pool.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the pool.
    thread_stack_size: Option<usize>,

    idle_spins: u32,

    idle_sleep: Duration,

    frame_alloc: Arc<dyn FrameAlloc>,

    caller_worker_zero: bool,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle_spins: IDLE_SPINS,
            idle_sleep: IDLE_SLEEP,
            frame_alloc: default_frame_alloc(),
            caller_worker_zero: false,
        }
    }

    /// Sets the number of workers.
    ///
    /// # Panics
    ///
    /// Panics if `val` is zero.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name of threads spawned by the pool.
    ///
    /// The default name is "jobble-worker-{index}".
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move |_| val.clone()));
        self
    }

    /// Sets a function deriving a thread name from the worker index.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets how many consecutive empty queue scans a worker tolerates
    /// before sleeping.
    pub fn idle_spins(mut self, val: u32) -> Self {
        self.idle_spins = val.max(1);
        self
    }

    /// Sets how long an idle worker sleeps between scans. Worker 0 never
    /// sleeps regardless.
    pub fn idle_sleep(mut self, val: Duration) -> Self {
        self.idle_sleep = val;
        self
    }

    /// Routes frame allocation through `alloc` for jobs built on worker
    /// threads.
    pub fn frame_alloc(mut self, alloc: Arc<dyn FrameAlloc>) -> Self {
        self.frame_alloc = alloc;
        self
    }

    /// Reserves worker 0 for the calling thread instead of spawning it.
    ///
    /// The pool spawns workers `1..N` and blocks them at the startup
    /// barrier until the caller enters the loop through
    /// [`JobSystem::run_caller_worker`]; no job runs before that.
    pub fn caller_runs_worker_zero(mut self) -> Self {
        self.caller_worker_zero = true;
        self
    }

    /// Starts the configured [`JobSystem`].
    pub fn try_build(self) -> Result<JobSystem> {
        let cfg = Config::try_from(self)?;
        Ok(JobSystem::start(cfg))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Builder::new()
    }
}

#[derive(Clone)]
pub(crate) struct Config {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) idle_spins: u32,
    pub(crate) idle_sleep: Duration,
    pub(crate) frame_alloc: Arc<dyn FrameAlloc>,
    pub(crate) caller_worker_zero: bool,
}

impl TryFrom<Builder> for Config {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Config> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()
                .context("failed to query available parallelism")?
                .get(),
        };

        Ok(Config {
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            idle_spins: builder.idle_spins,
            idle_sleep: builder.idle_sleep,
            frame_alloc: builder.frame_alloc,
            caller_worker_zero: builder.caller_worker_zero,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // The config is cloned into every spawned worker thread.
    assert_impl_all!(Config: Send, Sync, Clone);

    #[test]
    fn default_worker_count_matches_parallelism() {
        let cfg = Config::try_from(Builder::new()).unwrap();
        assert!(cfg.worker_threads > 0);
    }

    #[test]
    #[should_panic(expected = "worker threads cannot be set to 0")]
    fn zero_workers_rejected() {
        let _ = Builder::new().worker_threads(0);
    }
}
