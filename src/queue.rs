//! Intrusive lock-free run queues.
//!
//! Nodes link through `Header::next`; a node is reachable from exactly one
//! queue at a time. Two flavors:
//!
//! - [`InjectQueue`] - the shared queue. A Treiber stack: any thread pushes,
//!   any worker pops, LIFO order. Fairness is not a contract here.
//! - [`LocalQueue`] - one per worker. Any thread pushes at the head; only
//!   the owning worker pops, walking to the tail so the single consumer
//!   sees FIFO order. When the queue holds a single element the pop falls
//!   back to a head CAS and races producers, which can reorder at most one
//!   element.

use crate::job::header::Header;
use crossbeam_utils::CachePadded;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// The shared MPMC queue.
pub(crate) struct InjectQueue {
    head: CachePadded<AtomicPtr<Header>>,
}

// Safety: nodes are transferred between threads through the head CAS; the
// Release push / Acquire pop pair publishes the node's fields.
unsafe impl Send for InjectQueue {}
unsafe impl Sync for InjectQueue {}

impl InjectQueue {
    pub(crate) fn new() -> InjectQueue {
        InjectQueue {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Pushes a detached node. Wait-free per thread; never fails.
    pub(crate) fn push(&self, node: NonNull<Header>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: a detached node's link is owned by this producer.
            unsafe { node.as_ref() }.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops the most recently pushed node, or `None`.
    pub(crate) fn pop(&self) -> Option<NonNull<Header>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let node = NonNull::new(head)?;
            // `next` is re-read on every retry; the CAS keeps the window
            // between this load and the exchange to a single instruction
            // pair.
            let next = unsafe { node.as_ref() }.next.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    unsafe { node.as_ref() }
                        .next
                        .store(ptr::null_mut(), Ordering::Relaxed);
                    return Some(node);
                }
                Err(actual) => head = actual,
            }
        }
    }
}

/// A worker-local MPSC queue: many producers, one consumer.
pub(crate) struct LocalQueue {
    head: CachePadded<AtomicPtr<Header>>,
}

// Safety: see `InjectQueue`; additionally, non-head nodes are only touched
// by the single consumer.
unsafe impl Send for LocalQueue {}
unsafe impl Sync for LocalQueue {}

impl LocalQueue {
    pub(crate) fn new() -> LocalQueue {
        LocalQueue {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Pushes a detached node. Any thread may produce.
    pub(crate) fn push(&self, node: NonNull<Header>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: a detached node's link is owned by this producer.
            unsafe { node.as_ref() }.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pops the oldest node, or `None`.
    ///
    /// # Safety
    ///
    /// One consumer at a time: the owning worker, or the teardown drain
    /// after every worker has been joined.
    pub(crate) unsafe fn pop(&self) -> Option<NonNull<Header>> {
        let mut node = NonNull::new(self.head.load(Ordering::Acquire))?;

        // Walk to the tail. Producers only ever touch the queue head, so
        // everything past the first node belongs to the consumer.
        let mut prev: Option<NonNull<Header>> = None;
        loop {
            let next = unsafe { node.as_ref() }.next.load(Ordering::Acquire);
            match NonNull::new(next) {
                Some(next) => {
                    prev = Some(node);
                    node = next;
                }
                None => break,
            }
        }

        if let Some(prev) = prev {
            unsafe { prev.as_ref() }
                .next
                .store(ptr::null_mut(), Ordering::Relaxed);
            return Some(node);
        }

        // Single element observed: it is the CAS head, so race producers
        // for it. A winning producer makes us return the newest element
        // instead - the documented one-element FIFO violation.
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let node = NonNull::new(head)?;
            let next = unsafe { node.as_ref() }.next.load(Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    unsafe { node.as_ref() }
                        .next
                        .store(ptr::null_mut(), Ordering::Relaxed);
                    return Some(node);
                }
                Err(actual) => head = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::function::func;
    use std::sync::Arc;
    use std::thread;

    fn nodes(n: usize) -> Vec<crate::FnJob> {
        (0..n).map(|_| func(|| {})).collect()
    }

    #[test]
    fn inject_queue_is_lifo() {
        let queue = InjectQueue::new();
        let jobs = nodes(3);
        for job in &jobs {
            queue.push(job.raw().header_ptr());
        }

        for job in jobs.iter().rev() {
            assert_eq!(queue.pop(), Some(job.raw().header_ptr()));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn local_queue_is_fifo_for_single_consumer() {
        let queue = LocalQueue::new();
        let jobs = nodes(8);
        for job in &jobs {
            queue.push(job.raw().header_ptr());
        }

        for job in &jobs {
            assert_eq!(unsafe { queue.pop() }, Some(job.raw().header_ptr()));
        }
        assert_eq!(unsafe { queue.pop() }, None);
    }

    #[test]
    fn local_queue_delivers_across_producers() {
        let queue = Arc::new(LocalQueue::new());
        let per_thread = 100;

        let jobs: Vec<_> = (0..4).map(|_| nodes(per_thread)).collect();
        let batches: Vec<Vec<_>> = jobs
            .iter()
            .map(|batch| batch.iter().map(|job| job.raw()).collect())
            .collect();

        thread::scope(|s| {
            for batch in batches {
                let queue = Arc::clone(&queue);
                s.spawn(move || {
                    for raw in batch {
                        queue.push(raw.header_ptr());
                    }
                });
            }
        });

        let mut popped = Vec::new();
        while let Some(ptr) = unsafe { queue.pop() } {
            popped.push(ptr);
        }

        assert_eq!(popped.len(), jobs.iter().map(Vec::len).sum::<usize>());
        for job in jobs.iter().flatten() {
            assert!(popped.contains(&job.raw().header_ptr()));
        }
    }
}
