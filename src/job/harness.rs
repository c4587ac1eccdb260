#![allow(unsafe_op_in_unsafe_fn)]

use crate::job::header::Header;
use crate::job::layout::{FnCell, JobCell, Stage};
use crate::job::raw::RawJob;
use crate::runtime::Handle;
use std::any::Any;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

/// Typed view of a coroutine frame. All state checks and transitions of a
/// resume happen here.
pub(super) struct Harness<F: Future> {
    cell: NonNull<JobCell<F>>,
}

impl<F> Harness<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    /// Safety: `ptr` must point at a live `JobCell<F>`.
    pub(super) unsafe fn from_raw(ptr: NonNull<Header>) -> Harness<F> {
        Harness { cell: ptr.cast() }
    }

    fn header(&self) -> &Header {
        unsafe { &self.cell.as_ref().header }
    }

    fn raw(&self) -> RawJob {
        RawJob::from_ptr(self.cell.cast())
    }

    /// Resumes the frame up to its next suspension point or to completion.
    ///
    /// Wakeups flow through the child counters, never through a `Waker`, so
    /// the frame is polled with a no-op waker.
    pub(super) fn poll(self, handle: &Handle) {
        let header = self.header();
        debug_assert!(!header.done.load(Ordering::Acquire));
        header.moved.set(false);

        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| {
            // Safety: the worker that popped this node has exclusive access
            // to the stage, and the frame never moves off the heap.
            let stage = unsafe { &mut *self.cell.as_ref().stage.get() };
            let future = match stage {
                Stage::Running(future) => future,
                _ => unreachable!("frame polled after completion"),
            };
            let future = unsafe { Pin::new_unchecked(future) };
            future.poll(&mut cx)
        }));

        match polled {
            Err(payload) => abort_on_job_panic(payload),
            Ok(Poll::Ready(value)) => {
                // Final suspension: publish the value, then route the
                // completion notification to the awaiter. A continuation
                // job has no awaiter and keeps the parent link it inherited.
                unsafe { *self.cell.as_ref().stage.get() = Stage::Finished(value) };
                if let Some(awaiter) = header.coro_parent.get() {
                    header.parent.set(Some(awaiter));
                }
                header.done.store(true, Ordering::Release);
                self.raw().count_down(handle);
            }
            Ok(Poll::Pending) => {
                if header.moved.take() {
                    // Thread change: no counter unit is consumed.
                    handle.submit(self.raw());
                } else {
                    self.raw().count_down(handle);
                }
            }
        }
    }

    /// Moves the settled value into `dst`.
    ///
    /// Safety: `dst` must point at an `Option<F::Output>`.
    pub(super) unsafe fn read_value(self, dst: *mut ()) {
        let dst = dst as *mut Option<F::Output>;
        // Safety: completion synchronized through `done` / the counters; the
        // reader is the sole owner of the slot at this point.
        let stage = unsafe { &mut *self.cell.as_ref().stage.get() };
        match stage {
            Stage::Finished(_) => {
                let Stage::Finished(value) = mem::replace(stage, Stage::Consumed) else {
                    unreachable!()
                };
                unsafe { dst.write(Some(value)) };
            }
            Stage::Consumed => panic!("coroutine value already taken"),
            Stage::Running(_) => panic!("coroutine value read before completion"),
        }
    }
}

/// Typed view of a function frame.
pub(super) struct FnHarness<F> {
    cell: NonNull<FnCell<F>>,
}

impl<F> FnHarness<F>
where
    F: FnOnce() + Send + 'static,
{
    /// Safety: `ptr` must point at a live `FnCell<F>`.
    pub(super) unsafe fn from_raw(ptr: NonNull<Header>) -> FnHarness<F> {
        FnHarness { cell: ptr.cast() }
    }

    /// Runs the closure to completion, then consumes the body's counter unit.
    pub(super) fn run(self, handle: &Handle) {
        // Safety: exclusive access, as for `Harness::poll`.
        let body = unsafe { (*self.cell.as_ref().body.get()).take() };
        let body = body.expect("function job ran twice");

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
            abort_on_job_panic(payload);
        }

        RawJob::from_ptr(self.cell.cast()).count_down(handle);
    }
}

/// An uncaught failure inside a job body is unrecoverable: letting it unwind
/// would strand the node's counters mid-protocol.
#[cold]
fn abort_on_job_panic(payload: Box<dyn Any + Send>) -> ! {
    let msg = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    tracing::error!(msg, "job body panicked, aborting");
    std::process::abort();
}
