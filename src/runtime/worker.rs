use crate::context;
use crate::job::raw::RawJob;
use crate::queue::LocalQueue;
use crate::runtime::system::Handle;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use tracing::{debug, trace};

/// One worker of the pool: an index and the MPSC queue it consumes.
pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) queue: LocalQueue,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Arc<Worker> {
        Arc::new(Worker {
            index,
            queue: LocalQueue::new(),
        })
    }

    /// The worker loop. Runs until the system's terminate flag is set.
    pub(crate) fn run(&self, handle: &Handle) {
        context::enter_worker(handle.clone(), self.index);

        // No worker pops before every worker reached this point, so a job
        // submitted during startup cannot land on a half-initialized pool.
        handle.started.wait();
        debug!(worker = self.index, "worker online");

        let mut idle: u32 = 0;
        loop {
            if handle.terminate.load(Ordering::Acquire) {
                break;
            }

            // Safety: this thread is the queue's only consumer.
            let node = unsafe { self.queue.pop() }.or_else(|| handle.inject.pop());
            match node {
                Some(ptr) => {
                    idle = 0;
                    let raw = RawJob::from_ptr(ptr);
                    trace!(worker = self.index, kind = ?raw.header().kind, "run job");
                    context::set_current(Some(raw));
                    // Safety: popping the node gave us exclusive run access.
                    unsafe { raw.run(handle) };
                    context::set_current(None);
                }
                None => {
                    idle += 1;
                    if idle >= handle.cfg.idle_spins {
                        idle = 0;
                        // Worker 0 may be the caller's own thread; it stays
                        // hot instead of sleeping.
                        if self.index > 0 {
                            thread::sleep(handle.cfg.idle_sleep);
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                }
            }
        }

        context::exit_worker();
        debug!(worker = self.index, "worker offline");
    }
}
