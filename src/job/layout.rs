#![allow(unsafe_op_in_unsafe_fn)]

use crate::alloc::FrameAlloc;
use crate::job::harness::{FnHarness, Harness};
use crate::job::header::{Header, Kind};
use crate::runtime::Handle;
use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::future::Future;
use std::ptr::NonNull;
use std::sync::Arc;

/// Frame of a resumable job.
///
/// `Header` must stay the first field: the queues and the completion
/// protocol hold `NonNull<Header>` thin pointers and cast back to the full
/// cell through the vtable.
#[repr(C)]
pub(crate) struct JobCell<F: Future> {
    pub(super) header: Header,
    pub(super) stage: UnsafeCell<Stage<F>>,
}

/// Frame of a one-shot function job. Same layout rule as [`JobCell`].
#[repr(C)]
pub(crate) struct FnCell<F> {
    pub(super) header: Header,
    pub(super) body: UnsafeCell<Option<F>>,
}

/// Either the live future or its settled value.
pub(super) enum Stage<F: Future> {
    Running(F),
    Finished(F::Output),
    Consumed,
}

impl<F> JobCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    /// Allocates a coroutine frame through `alloc` with both shares (user
    /// handle + scheduler) outstanding.
    pub(crate) fn allocate(future: F, alloc: Arc<dyn FrameAlloc>) -> NonNull<Header> {
        let layout = Layout::new::<JobCell<F>>();
        let ptr = alloc.allocate(layout).cast::<JobCell<F>>();
        let cell = JobCell {
            header: Header::new(Kind::Coro, coro_vtable::<F>(), alloc),
            stage: UnsafeCell::new(Stage::Running(future)),
        };
        // Safety: `ptr` is freshly allocated for exactly this layout.
        unsafe { ptr.as_ptr().write(cell) };
        ptr.cast()
    }
}

impl<F> FnCell<F>
where
    F: FnOnce() + Send + 'static,
{
    pub(crate) fn allocate(body: F, alloc: Arc<dyn FrameAlloc>) -> NonNull<Header> {
        let layout = Layout::new::<FnCell<F>>();
        let ptr = alloc.allocate(layout).cast::<FnCell<F>>();
        let cell = FnCell {
            header: Header::new(Kind::Function, fn_vtable::<F>(), alloc),
            body: UnsafeCell::new(Some(body)),
        };
        // Safety: `ptr` is freshly allocated for exactly this layout.
        unsafe { ptr.as_ptr().write(cell) };
        ptr.cast()
    }
}

/// Erased entry points for one frame type. One static instance per generic
/// instantiation, promoted the same way the compiler promotes any const.
pub(crate) struct Vtable {
    /// Runs the node's body on the current worker.
    pub(crate) run: unsafe fn(NonNull<Header>, &Handle),

    /// Moves the settled value out of the return slot. `dst` points at an
    /// `Option<T>` matching the frame's output type.
    pub(crate) read_value: unsafe fn(NonNull<Header>, *mut ()),

    /// Drops the frame contents and releases its memory through the
    /// allocator stored in the header.
    pub(crate) dealloc: unsafe fn(NonNull<Header>),
}

fn coro_vtable<F>() -> &'static Vtable
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    &Vtable {
        run: poll_coro::<F>,
        read_value: read_value::<F>,
        dealloc: dealloc_coro::<F>,
    }
}

fn fn_vtable<F>() -> &'static Vtable
where
    F: FnOnce() + Send + 'static,
{
    &Vtable {
        run: run_fn::<F>,
        read_value: no_value,
        dealloc: dealloc_fn::<F>,
    }
}

unsafe fn poll_coro<F>(ptr: NonNull<Header>, handle: &Handle)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Harness::<F>::from_raw(ptr).poll(handle);
}

unsafe fn read_value<F>(ptr: NonNull<Header>, dst: *mut ())
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Harness::<F>::from_raw(ptr).read_value(dst);
}

unsafe fn dealloc_coro<F>(ptr: NonNull<Header>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let cell = ptr.cast::<JobCell<F>>();
    let layout = Layout::new::<JobCell<F>>();
    // Keep the allocator alive past the frame drop; the header's own copy
    // goes down with the frame.
    let alloc = cell.as_ref().header.alloc.clone();
    std::ptr::drop_in_place(cell.as_ptr());
    alloc.deallocate(ptr.cast(), layout);
}

unsafe fn run_fn<F>(ptr: NonNull<Header>, handle: &Handle)
where
    F: FnOnce() + Send + 'static,
{
    FnHarness::<F>::from_raw(ptr).run(handle);
}

unsafe fn no_value(_ptr: NonNull<Header>, _dst: *mut ()) {
    panic!("function jobs have no return slot");
}

unsafe fn dealloc_fn<F>(ptr: NonNull<Header>)
where
    F: FnOnce() + Send + 'static,
{
    let cell = ptr.cast::<FnCell<F>>();
    let layout = Layout::new::<FnCell<F>>();
    let alloc = cell.as_ref().header.alloc.clone();
    std::ptr::drop_in_place(cell.as_ptr());
    alloc.deallocate(ptr.cast(), layout);
}
