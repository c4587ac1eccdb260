use crate::alloc::FrameAlloc;
use crate::context;
use crate::job::raw::RawJob;
use crate::job::{Coro, FnJob};
use crate::queue::InjectQueue;
use crate::runtime::builder::{Builder, Config};
use crate::runtime::pool::ThreadPool;
use crate::runtime::worker::Worker;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use tracing::{debug, trace};

/// State shared by every worker and handle of one job system.
#[doc(hidden)]
pub struct Shared {
    pub(crate) cfg: Config,

    /// The shared MPMC queue: jobs without a (valid) affinity land here and
    /// any worker may pop them.
    pub(crate) inject: InjectQueue,

    /// One per worker; a worker prefers its own queue over `inject`.
    pub(crate) workers: Vec<Arc<Worker>>,

    /// Workers exit their loop once this is set.
    pub(crate) terminate: AtomicBool,

    /// Startup rendezvous: no worker pops before every worker reached its
    /// loop.
    pub(crate) started: Barrier,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

/// A cheap, cloneable reference to a job system's shared state.
#[derive(Clone)]
pub struct Handle(Arc<Shared>);

impl Deref for Handle {
    type Target = Shared;

    fn deref(&self) -> &Shared {
        &self.0
    }
}

impl Handle {
    /// Pushes a detached node to its routed queue.
    ///
    /// After termination the node is dropped silently: the scheduler share
    /// is released instead of enqueued.
    pub(crate) fn submit(&self, raw: RawJob) {
        if self.terminate.load(Ordering::Acquire) {
            trace!("job dropped: system terminating");
            raw.drop_reference();
            return;
        }

        #[cfg(test)]
        self.tracker.record_submit();

        let header = raw.header();
        trace!(
            kind = ?header.kind,
            affinity = ?header.affinity.get(),
            tag = ?header.tag.get(),
            id = ?header.trace_id.get(),
            "submit job"
        );

        match header.affinity.get() {
            Some(worker) if worker < self.workers.len() => {
                self.workers[worker].queue.push(raw.header_ptr());
            }
            _ => self.inject.push(raw.header_ptr()),
        }
    }

    /// Claims a node, links it under `parent`, and pushes it. The parent's
    /// counter must already account for it.
    #[track_caller]
    pub(crate) fn submit_linked(&self, raw: RawJob, parent: Option<RawJob>) {
        let header = raw.header();
        header.claim();

        if let Some(parent) = parent {
            match header.kind {
                // The awaiter is notified at final suspension, once the
                // value is in the slot.
                crate::job::Kind::Coro => header.coro_parent.set(Some(parent.header_ptr())),
                crate::job::Kind::Function => header.parent.set(Some(parent.header_ptr())),
            }
        }

        #[cfg(test)]
        self.tracker.record_claim();

        self.submit(raw);
    }

    /// Entry point for `schedule`: attaches the node to the job currently
    /// running on this thread, if any, then submits it.
    #[track_caller]
    pub(crate) fn schedule_raw(&self, raw: RawJob) {
        let parent = context::current_raw();
        if let Some(parent) = parent {
            parent.header().children.fetch_add(1, Ordering::Relaxed);
        }
        self.submit_linked(raw, parent);
    }

    pub(crate) fn frame_alloc(&self) -> Arc<dyn FrameAlloc> {
        self.cfg.frame_alloc.clone()
    }

    pub(crate) fn terminate(&self) {
        if !self.terminate.swap(true, Ordering::AcqRel) {
            debug!("job system terminating");
        }
    }
}

/// A pool of workers executing function jobs and coroutine jobs with
/// structured fan-out/fan-in completion.
///
/// Most programs use the process-wide [`instance`]; tests and embedders can
/// run several isolated systems side by side via [`Builder::try_build`].
pub struct JobSystem {
    handle: Handle,
    pool: ThreadPool,
}

impl JobSystem {
    pub(crate) fn start(cfg: Config) -> JobSystem {
        let workers = (0..cfg.worker_threads).map(Worker::new).collect();
        let started = Barrier::new(cfg.worker_threads);

        let handle = Handle(Arc::new(Shared {
            cfg,
            inject: InjectQueue::new(),
            workers,
            terminate: AtomicBool::new(false),
            started,
            #[cfg(test)]
            tracker: Tracker::default(),
        }));

        let pool = ThreadPool::spawn(&handle);
        debug!(workers = handle.cfg.worker_threads, "job system started");

        JobSystem { handle, pool }
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Submits work: a wrapped function, a reference to a coroutine handle,
    /// or a container of either.
    ///
    /// Called from inside a running job, the submitted work becomes a child
    /// of that job.
    #[track_caller]
    pub fn schedule<W: Schedulable>(&self, work: W) {
        work.schedule_with(&self.handle);
    }

    /// Enters worker 0's loop on the calling thread.
    ///
    /// Only valid for systems built with
    /// [`Builder::caller_runs_worker_zero`]; returns once the system
    /// terminates.
    #[track_caller]
    pub fn run_caller_worker(&self) {
        assert!(
            self.handle.cfg.caller_worker_zero,
            "system was not built with caller_runs_worker_zero"
        );
        self.handle.workers[0].run(&self.handle);
    }

    /// Signals every worker to exit after its current job.
    pub fn terminate(&self) {
        self.handle.terminate();
    }

    /// Joins all workers, then destroys queued jobs that never ran.
    ///
    /// Callable only off the pool (a worker joining itself would deadlock).
    pub fn wait_for_termination(&self) {
        if let Err(err) = self.pool.join_all() {
            panic!("worker pool shutdown failed: {err:?}");
        }
        self.drain();
    }

    /// Releases every node still sitting in a queue. Runs strictly after
    /// all workers have been joined.
    fn drain(&self) {
        for worker in &self.handle.workers {
            // Safety: workers are gone; this thread is the sole consumer.
            while let Some(ptr) = unsafe { worker.queue.pop() } {
                RawJob::from_ptr(ptr).discard();
            }
        }
        while let Some(ptr) = self.handle.inject.pop() {
            RawJob::from_ptr(ptr).discard();
        }
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.terminate();
        self.wait_for_termination();
    }
}

/// Work acceptable to [`schedule`] / [`JobSystem::schedule`].
pub trait Schedulable {
    #[doc(hidden)]
    fn schedule_with(self, handle: &Handle);
}

impl Schedulable for FnJob {
    #[track_caller]
    fn schedule_with(self, handle: &Handle) {
        let raw = self.into_raw();
        handle.schedule_raw(raw);
        // The handle is gone; release the user share now that the node is
        // safely owned by a queue.
        raw.drop_reference();
    }
}

impl<T: Send + 'static> Schedulable for &Coro<T> {
    #[track_caller]
    fn schedule_with(self, handle: &Handle) {
        handle.schedule_raw(self.raw());
    }
}

impl<S: Schedulable> Schedulable for Vec<S> {
    #[track_caller]
    fn schedule_with(self, handle: &Handle) {
        for work in self {
            work.schedule_with(handle);
        }
    }
}

impl<'a, T: Send + 'static> Schedulable for &'a Vec<Coro<T>> {
    #[track_caller]
    fn schedule_with(self, handle: &Handle) {
        for coro in self {
            coro.schedule_with(handle);
        }
    }
}

// --- process-wide singleton -------------------------------------------------

static INSTANCE: Mutex<Option<Arc<JobSystem>>> = Mutex::new(None);

/// Starts the process-wide system with `builder`, or returns the existing
/// one. Creation parameters after the first call are ignored.
pub fn init(builder: Builder) -> anyhow::Result<Arc<JobSystem>> {
    let mut slot = INSTANCE.lock();
    if let Some(system) = slot.as_ref() {
        return Ok(system.clone());
    }
    let system = Arc::new(builder.try_build()?);
    *slot = Some(system.clone());
    Ok(system)
}

/// The process-wide system, started with default settings on first access.
pub fn instance() -> Arc<JobSystem> {
    init(Builder::new()).expect("failed to start the job system")
}

fn try_instance() -> Option<Arc<JobSystem>> {
    INSTANCE.lock().clone()
}

/// Tears down the process-wide system so the next [`instance`] call starts
/// fresh. Test hook; not part of the public contract.
#[doc(hidden)]
pub fn reset_instance() {
    let system = INSTANCE.lock().take();
    drop(system);
}

// --- free-function surface --------------------------------------------------

/// Submits work through the current worker's system, or the process-wide
/// one when called off the pool.
#[track_caller]
pub fn schedule<W: Schedulable>(work: W) {
    match context::try_handle() {
        Some(handle) => work.schedule_with(&handle),
        None => work.schedule_with(instance().handle()),
    }
}

/// Signals the current worker's system (or the process-wide one) to stop.
pub fn terminate() {
    if let Some(handle) = context::try_handle() {
        handle.terminate();
        return;
    }
    if let Some(system) = try_instance() {
        system.terminate();
    }
}

/// Blocks until the process-wide system's workers have exited. No-op when
/// no instance was ever created.
pub fn wait_for_termination() {
    if let Some(system) = try_instance() {
        system.wait_for_termination();
    }
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct Tracker {
    claims: std::sync::atomic::AtomicUsize,
    submits: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl Tracker {
    fn record_claim(&self) {
        self.claims.fetch_add(1, Ordering::Relaxed);
    }

    fn record_submit(&self) {
        self.submits.fetch_add(1, Ordering::Relaxed);
    }

    /// Distinct jobs handed to the scheduler.
    pub(crate) fn claims(&self) -> usize {
        self.claims.load(Ordering::Relaxed)
    }

    /// Queue pushes, counting re-submissions of resumed coroutines.
    pub(crate) fn submits(&self) -> usize {
        self.submits.load(Ordering::Relaxed)
    }
}
