use crate::job::header::{Header, Kind};
use crate::runtime::Handle;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use tracing::trace;

/// Erased job handle: a thin header pointer plus vtable dispatch.
///
/// `RawJob` is plain data; it carries no ownership. Shares of the frame are
/// tracked by `Header::refs` and released through [`RawJob::drop_reference`].
#[derive(Clone, Copy)]
pub(crate) struct RawJob {
    ptr: NonNull<Header>,
}

// Safety: the frame is heap-allocated and its header is Send + Sync.
unsafe impl Send for RawJob {}

impl RawJob {
    pub(crate) fn from_ptr(ptr: NonNull<Header>) -> RawJob {
        RawJob { ptr }
    }

    pub(crate) fn header_ptr(&self) -> NonNull<Header> {
        self.ptr
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: the caller holds or borrows a live share of the frame.
        unsafe { self.ptr.as_ref() }
    }

    /// Runs the node's body.
    ///
    /// # Safety
    ///
    /// Only a worker that popped this node from a queue may call this, and
    /// at most one worker at a time.
    pub(crate) unsafe fn run(self, handle: &Handle) {
        unsafe { (self.header().vtable.run)(self.ptr, handle) }
    }

    /// Moves the settled value into `dst` (an `Option<T>` of the frame's
    /// output type).
    ///
    /// # Safety
    ///
    /// `dst` must match the frame's output type, and the frame must have
    /// reached final suspension.
    pub(crate) unsafe fn read_value(self, dst: *mut ()) {
        unsafe { (self.header().vtable.read_value)(self.ptr, dst) }
    }

    /// Releases one frame share; the last share frees the frame.
    pub(crate) fn drop_reference(self) {
        if self.header().refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Safety: every share is gone, so nobody else can reach the frame.
            unsafe { (self.header().vtable.dealloc)(self.ptr) }
        }
    }
}

/// Completion protocol.
impl RawJob {
    /// Consumes one unit of `children`. The observer of the zero transition
    /// continues with the completion step.
    pub(crate) fn count_down(self, handle: &Handle) {
        if dec_children(self.header()) {
            self.on_zero(handle);
        }
    }

    /// Runs when a node's counter hits zero. Iterative over the parent
    /// chain; every step of the walk is in tail position.
    fn on_zero(self, handle: &Handle) {
        let mut node = self;
        loop {
            let header = node.header();

            // A suspended coroutine whose awaited children all finished:
            // restore the body's counter unit and resume it. The zero
            // transition hands the protocol exclusive ownership, so the
            // plain store cannot race.
            if header.kind == Kind::Coro && !header.done.load(Ordering::Acquire) {
                header.children.store(1, Ordering::Relaxed);
                handle.submit(node);
                return;
            }

            trace!(
                kind = ?header.kind,
                tag = ?header.tag.get(),
                id = ?header.trace_id.get(),
                "job subtree complete"
            );

            // Hand the continuation over to our parent before scheduling it,
            // so the parent cannot complete ahead of the continuation.
            if let Some(cont) = header.continuation.take() {
                let cont = RawJob::from_ptr(cont);
                if let Some(parent) = header.parent.get() {
                    // Safety: a live child keeps its parent's frame alive.
                    unsafe { parent.as_ref() }
                        .children
                        .fetch_add(1, Ordering::Relaxed);
                    cont.header().parent.set(Some(parent));
                }
                handle.submit(cont);
            }

            let parent = header.parent.get();

            // The scheduler is finished with this node. Do not touch it
            // past this point.
            node.drop_reference();

            match parent {
                Some(parent) => {
                    let parent = RawJob::from_ptr(parent);
                    if dec_children(parent.header()) {
                        node = parent;
                        continue;
                    }
                    return;
                }
                None => return,
            }
        }
    }

    /// Teardown path for a queued node that never ran. Releases the
    /// scheduler's share of the node, its continuation chain, and every
    /// ancestor whose last outstanding child this was.
    ///
    /// Safe only once all workers have stopped: nothing concurrently runs
    /// or completes jobs, so the counters are quiescent.
    pub(crate) fn discard(self) {
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            if !dec_children(node.header()) {
                continue;
            }
            let header = node.header();
            if let Some(cont) = header.continuation.take() {
                pending.push(RawJob::from_ptr(cont));
            }
            // Mid-life coroutines hold their awaiter in `coro_parent`;
            // completed ones already copied it into `parent`.
            if let Some(parent) = header.parent.get().or(header.coro_parent.get()) {
                pending.push(RawJob::from_ptr(parent));
            }
            node.drop_reference();
        }
    }
}

/// Decrements a fan-in counter, reporting whether it reached zero.
fn dec_children(header: &Header) -> bool {
    let prev = header.children.fetch_sub(1, Ordering::AcqRel);
    if prev <= 0 {
        counter_underflow();
    }
    prev == 1
}

#[cold]
fn counter_underflow() -> ! {
    panic!("job child counter underflow");
}
