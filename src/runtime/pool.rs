use crate::runtime::system::Handle;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::thread;

/// The OS threads behind a job system's workers.
pub(crate) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns one thread per worker. With `caller_runs_worker_zero`, worker
    /// 0 is left for the caller to enter via `JobSystem::run_caller_worker`.
    pub(crate) fn spawn(handle: &Handle) -> ThreadPool {
        let first = usize::from(handle.cfg.caller_worker_zero);
        let mut handles = Vec::with_capacity(handle.cfg.worker_threads.saturating_sub(first));

        for worker in handle.workers.iter().skip(first) {
            let mut builder = thread::Builder::new().name((handle.cfg.thread_name.0)(worker.index));
            if let Some(stack_size) = handle.cfg.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let handle = handle.clone();
            let worker = worker.clone();
            let join = builder
                .spawn(move || worker.run(&handle))
                .expect("failed to spawn worker thread");
            handles.push(join);
        }

        ThreadPool {
            handles: Mutex::new(handles),
        }
    }

    /// Joins every spawned worker, surfacing panicked threads.
    pub(crate) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();

        let panicked = handles
            .drain(..)
            .map(|join| join.join())
            .filter(Result::is_err)
            .count();

        if panicked == 0 {
            Ok(())
        } else {
            Err(anyhow!("{panicked} worker thread(s) panicked"))
        }
    }
}
