use crate::alloc::FrameAlloc;
use crate::job::layout::Vtable;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8};

/// Job discriminator: a one-shot closure or a resumable coroutine frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Runs a caller-supplied closure to completion, exactly once.
    Function,
    /// Resumes a suspended frame; may suspend again on child completion or
    /// on a thread change.
    Coro,
}

/// Hot per-job state, shared by both job kinds.
///
/// `Header` is always the first field of a frame, so the queues and the
/// completion protocol address every job through a thin `NonNull<Header>`
/// and dispatch typed work through the vtable.
pub(crate) struct Header {
    /// Intrusive link used by the run queues. Owned by the queue that
    /// currently holds the node, null while detached.
    pub(crate) next: AtomicPtr<Header>,

    /// Fan-in counter: the node's own body plus every live child. Starts at
    /// 1; the body's unit is consumed when a run of the body ends, each
    /// child's unit when that child's subtree completes. The observer of a
    /// zero transition runs the completion protocol.
    pub(crate) children: AtomicI32,

    /// Node notified when this subtree completes. Written while the node is
    /// exclusively owned: before first publication for function jobs, at
    /// final suspension for coroutines.
    pub(crate) parent: Cell<Option<NonNull<Header>>>,

    /// Scheduled once this node's subtree completes, inheriting `parent`.
    pub(crate) continuation: Cell<Option<NonNull<Header>>>,

    /// Pinned worker index. `None` (or out of range) routes to the shared
    /// queue.
    pub(crate) affinity: Cell<Option<usize>>,

    /// The coroutine that awaited (or submitted) this one. Copied into
    /// `parent` at final suspension, so the awaiter is notified only once
    /// the value is in the return slot.
    pub(crate) coro_parent: Cell<Option<NonNull<Header>>>,

    /// Frame shares: user handle + scheduler. The frame is released on the
    /// 1 -> 0 transition.
    pub(crate) refs: AtomicU8,

    /// The frame reached final suspension; the return slot is readable.
    pub(crate) done: AtomicBool,

    /// Set by the change-thread awaitable within a poll: re-enqueue on the
    /// recorded affinity without consuming the body's counter unit.
    pub(crate) moved: Cell<bool>,

    /// The node has been handed to the scheduler once. Guards against a
    /// handle scheduling the same node twice.
    pub(crate) claimed: Cell<bool>,

    pub(crate) kind: Kind,
    pub(crate) vtable: &'static Vtable,

    /// Opaque metadata surfaced in trace events. Never affects scheduling.
    pub(crate) tag: Cell<Option<i32>>,
    pub(crate) trace_id: Cell<Option<i32>>,

    /// Allocator that produced this frame; deallocation goes back through it.
    pub(crate) alloc: Arc<dyn FrameAlloc>,
}

// Safety: the `Cell` fields are only touched while the node is exclusively
// owned - by the handle before the node is claimed, or by the worker
// currently running it. Cross-thread hand-off goes through the queue CAS and
// the `children`/`refs` atomics.
unsafe impl Send for Header {}
unsafe impl Sync for Header {}

impl Header {
    pub(crate) fn new(kind: Kind, vtable: &'static Vtable, alloc: Arc<dyn FrameAlloc>) -> Header {
        Header {
            next: AtomicPtr::new(std::ptr::null_mut()),
            children: AtomicI32::new(1),
            parent: Cell::new(None),
            continuation: Cell::new(None),
            affinity: Cell::new(None),
            coro_parent: Cell::new(None),
            refs: AtomicU8::new(2),
            done: AtomicBool::new(false),
            moved: Cell::new(false),
            claimed: Cell::new(false),
            kind,
            vtable,
            tag: Cell::new(None),
            trace_id: Cell::new(None),
            alloc,
        }
    }

    /// Marks the node as handed to the scheduler. Panics on the second claim.
    #[track_caller]
    pub(crate) fn claim(&self) {
        assert!(!self.claimed.replace(true), "job scheduled twice");
    }
}
