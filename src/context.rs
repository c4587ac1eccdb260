//! Thread-local worker state.
//!
//! Each worker thread installs a context on entry to its loop: the
//! scheduler handle, its worker index, and the currently running job. The
//! awaitables and the free-function API read it; off-worker threads simply
//! see no context.

use crate::alloc::FrameAlloc;
use crate::job::header::Kind;
use crate::job::raw::RawJob;
use crate::runtime::Handle;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

pub(crate) struct WorkerContext {
    pub(crate) handle: Handle,
    pub(crate) index: usize,
    pub(crate) current: Cell<Option<RawJob>>,
}

thread_local! {
    static CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

pub(crate) fn enter_worker(handle: Handle, index: usize) {
    CONTEXT.with(|ctx| {
        let replaced = ctx.borrow_mut().replace(WorkerContext {
            handle,
            index,
            current: Cell::new(None),
        });
        debug_assert!(replaced.is_none(), "worker context entered twice");
    });
}

pub(crate) fn exit_worker() {
    CONTEXT.with(|ctx| ctx.borrow_mut().take());
}

pub(crate) fn with_worker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&WorkerContext) -> R,
{
    CONTEXT.with(|ctx| ctx.borrow().as_ref().map(f))
}

/// Like [`with_worker`], but calling it off a worker thread is a
/// programmer error.
#[track_caller]
pub(crate) fn expect_worker<F, R>(what: &str, f: F) -> R
where
    F: FnOnce(&WorkerContext) -> R,
{
    match with_worker(f) {
        Some(out) => out,
        None => panic!("cannot {what} outside a worker thread"),
    }
}

pub(crate) fn set_current(raw: Option<RawJob>) {
    CONTEXT.with(|ctx| {
        if let Some(worker) = ctx.borrow().as_ref() {
            worker.current.set(raw);
        }
    });
}

pub(crate) fn current_raw() -> Option<RawJob> {
    with_worker(|worker| worker.current.get()).flatten()
}

pub(crate) fn try_handle() -> Option<Handle> {
    with_worker(|worker| worker.handle.clone())
}

/// Allocator used for frames built on this thread: the scheduler's frame
/// allocator on a worker, the global allocator elsewhere.
pub(crate) fn frame_alloc() -> Arc<dyn FrameAlloc> {
    with_worker(|worker| worker.handle.frame_alloc())
        .unwrap_or_else(crate::alloc::default_frame_alloc)
}

/// The calling worker's index, or `None` off the pool.
pub fn thread_index() -> Option<usize> {
    with_worker(|worker| worker.index)
}

/// Metadata of the job currently executing on this worker.
///
/// `None` when called outside a worker thread or between jobs.
pub fn current_job() -> Option<JobToken> {
    current_raw().map(|raw| {
        let header = raw.header();
        JobToken {
            kind: header.kind,
            affinity: header.affinity.get(),
            tag: header.tag.get(),
            trace_id: header.trace_id.get(),
        }
    })
}

/// A read-only view of the currently running job.
#[derive(Debug, Clone, Copy)]
pub struct JobToken {
    kind: Kind,
    affinity: Option<usize>,
    tag: Option<i32>,
    trace_id: Option<i32>,
}

impl JobToken {
    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    pub fn tag(&self) -> Option<i32> {
        self.tag
    }

    pub fn trace_id(&self) -> Option<i32> {
        self.trace_id
    }
}
