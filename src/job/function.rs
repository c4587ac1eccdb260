use crate::alloc::FrameAlloc;
use crate::context;
use crate::job::layout::FnCell;
use crate::job::raw::RawJob;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

/// Wraps a closure as a schedulable leaf job.
///
/// The closure runs to completion on one worker, exactly once. Like any
/// job, it may schedule children from its body; the job's subtree is
/// complete only once those children finish.
pub fn func<F>(body: F) -> FnJob
where
    F: FnOnce() + Send + 'static,
{
    FnJob::new_in(body, context::frame_alloc())
}

/// An owned handle to a one-shot function job.
///
/// Built by [`func`]. Schedule it, await it from inside a coroutine, or
/// hand it to [`continue_with`] as another job's continuation.
///
/// [`continue_with`]: FnJob::continue_with
pub struct FnJob {
    raw: Option<RawJob>,
}

// Safety: the frame is heap-allocated from a Send closure; the handle is
// the single owner of its share.
unsafe impl Send for FnJob {}

impl FnJob {
    /// Wraps a closure, placing its frame with `alloc`.
    pub fn new_in<F>(body: F, alloc: Arc<dyn FrameAlloc>) -> FnJob
    where
        F: FnOnce() + Send + 'static,
    {
        let ptr = FnCell::allocate(body, alloc);
        FnJob {
            raw: Some(RawJob::from_ptr(ptr)),
        }
    }

    /// Pins the job to a worker. Out-of-range indices fall back to the
    /// shared queue.
    #[track_caller]
    pub fn with_affinity(self, worker: usize) -> Self {
        self.configure(|raw| raw.header().affinity.set(Some(worker)))
    }

    /// Attaches an opaque type tag, surfaced in trace events.
    #[track_caller]
    pub fn with_tag(self, tag: i32) -> Self {
        self.configure(|raw| raw.header().tag.set(Some(tag)))
    }

    /// Attaches an opaque per-call id, surfaced in trace events.
    #[track_caller]
    pub fn with_trace_id(self, id: i32) -> Self {
        self.configure(|raw| raw.header().trace_id.set(Some(id)))
    }

    /// Sets a job to schedule once this job's subtree completes. The
    /// continuation inherits this job's parent.
    #[track_caller]
    pub fn continue_with(self, next: impl Continuation) -> Self {
        self.configure(|raw| {
            assert!(
                raw.header().continuation.get().is_none(),
                "continuation already set"
            );
            let next = next.into_continuation();
            raw.header().continuation.set(Some(next.0.header_ptr()));
        })
    }

    #[track_caller]
    fn configure(self, f: impl FnOnce(&RawJob)) -> Self {
        let raw = self.raw();
        assert!(
            !raw.header().claimed.get(),
            "job configured after scheduling"
        );
        f(&raw);
        self
    }

    pub(crate) fn raw(&self) -> RawJob {
        *self.raw.as_ref().expect("job handle already consumed")
    }

    /// Detaches the node from this handle without releasing any share.
    pub(crate) fn into_raw(mut self) -> RawJob {
        self.raw.take().expect("job handle already consumed")
    }
}

/// Awaiting a wrapped function spawns it as a child of the current job and
/// resumes the awaiter once its subtree completes. Functions carry no
/// return slot, so the await yields `()`.
impl Future for FnJob {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let raw = this.raw();

        if !raw.header().claimed.get() {
            context::expect_worker("await a job", |ctx| {
                let parent = ctx.current.get().expect("no job running on this worker");
                parent.header().children.fetch_add(1, Ordering::Relaxed);
                ctx.handle.submit_linked(raw, Some(parent));
            });
            return Poll::Pending;
        }

        Poll::Ready(())
    }
}

impl Drop for FnJob {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            if raw.header().claimed.get() {
                raw.drop_reference();
            } else {
                // Never entered the scheduler: the frame is wholly ours.
                unsafe { (raw.header().vtable.dealloc)(raw.header_ptr()) };
            }
        }
    }
}

impl fmt::Debug for FnJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnJob")
            .field("claimed", &self.raw.map(|r| r.header().claimed.get()))
            .finish()
    }
}

/// A claimed, detached node waiting to be installed as a continuation.
#[doc(hidden)]
pub struct ContinuationNode(pub(crate) RawJob);

/// Jobs that can be installed as another job's continuation.
///
/// Implemented by [`FnJob`] (consumed: the scheduler takes over the node)
/// and by `&Coro<T>` (the handle stays with the caller for [`Coro::get`]).
///
/// [`Coro::get`]: crate::Coro::get
pub trait Continuation {
    #[doc(hidden)]
    fn into_continuation(self) -> ContinuationNode;
}

impl Continuation for FnJob {
    fn into_continuation(self) -> ContinuationNode {
        let raw = self.into_raw();
        raw.header().claim();
        // The handle is gone; only the scheduler share keeps the frame.
        raw.drop_reference();
        ContinuationNode(raw)
    }
}

impl<T: Send + 'static> Continuation for &super::coro::Coro<T> {
    fn into_continuation(self) -> ContinuationNode {
        let raw = self.raw();
        raw.header().claim();
        ContinuationNode(raw)
    }
}
