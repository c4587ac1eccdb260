use crate::alloc::FrameAlloc;
use crate::context;
use crate::job::function::Continuation;
use crate::job::layout::JobCell;
use crate::job::raw::RawJob;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

/// An owned handle to a resumable job returning `T`.
///
/// Constructing a `Coro` suspends the frame before any user code runs; only
/// scheduling it (or awaiting it from inside another job) enqueues it.
/// Awaiting a `Coro` inside a coroutine spawns it as a child and resumes the
/// awaiter once the child's whole subtree has completed, yielding the
/// child's value.
///
/// A handle scheduled at the root keeps access to the result: poll
/// [`is_finished`] and read it with [`get`]. Dropping the handle detaches
/// the job; it still runs to completion and its frame is released by the
/// scheduler.
///
/// [`is_finished`]: Coro::is_finished
/// [`get`]: Coro::get
pub struct Coro<T> {
    raw: Option<RawJob>,
    _p: PhantomData<T>,
}

// Safety: the frame is heap-allocated from a Send future; the handle is the
// single owner of its share.
unsafe impl<T: Send> Send for Coro<T> {}

impl<T> Unpin for Coro<T> {}

impl<T: Send + 'static> Coro<T> {
    /// Wraps a future as a schedulable coroutine job.
    ///
    /// The frame is allocated through the scheduler's frame allocator when
    /// called on a worker thread, through the global allocator otherwise.
    pub fn new<F>(future: F) -> Coro<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self::new_in(future, context::frame_alloc())
    }

    /// Wraps a future, placing its frame with `alloc`.
    pub fn new_in<F>(future: F, alloc: Arc<dyn FrameAlloc>) -> Coro<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let ptr = JobCell::allocate(future, alloc);
        Coro {
            raw: Some(RawJob::from_ptr(ptr)),
            _p: PhantomData,
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

    /// Sets a job to schedule once this coroutine's subtree completes. The
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
            "coroutine configured after scheduling"
        );
        f(&raw);
        self
    }

    /// Whether the frame has reached final suspension, i.e. the return slot
    /// holds a value.
    pub fn is_finished(&self) -> bool {
        self.raw().header().done.load(Ordering::Acquire)
    }

    /// Consumes the handle and reads the return slot.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine has not completed, or if the value was
    /// already taken.
    #[track_caller]
    pub fn get(self) -> T {
        assert!(
            self.is_finished(),
            "coroutine value read before completion"
        );
        self.take_value()
    }

    pub(crate) fn raw(&self) -> RawJob {
        *self.raw.as_ref().expect("coroutine handle already consumed")
    }

    pub(crate) fn take_value(&self) -> T {
        let mut out: Option<T> = None;
        // Safety: `T` is this frame's output type by construction.
        unsafe { self.raw().read_value(&mut out as *mut Option<T> as *mut ()) };
        out.expect("return slot was empty")
    }
}

/// The single-child awaitable: spawns the coroutine as a child of the
/// current job on the first poll, yields its value once the subtree is done.
impl<T: Send + 'static> Future for Coro<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let raw = this.raw();

        if !raw.header().claimed.get() {
            context::expect_worker("await a coroutine", |ctx| {
                let parent = ctx.current.get().expect("no job running on this worker");
                parent.header().children.fetch_add(1, Ordering::Relaxed);
                ctx.handle.submit_linked(raw, Some(parent));
            });
            return Poll::Pending;
        }

        // The scheduler only resumes the awaiter after the child's subtree
        // completed, so the slot is settled here.
        debug_assert!(raw.header().done.load(Ordering::Acquire));
        Poll::Ready(this.take_value())
    }
}

impl<T> Drop for Coro<T> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            if raw.header().claimed.get() {
                // Release the user share; the scheduler still drives the job.
                raw.drop_reference();
            } else {
                // Never entered the scheduler: the frame is wholly ours.
                unsafe { (raw.header().vtable.dealloc)(raw.header_ptr()) };
            }
        }
    }
}

impl<T> fmt::Debug for Coro<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coro")
            .field("finished", &self.raw.map(|r| r.header().done.load(Ordering::Relaxed)))
            .finish()
    }
}
