use crate::alloc::{FrameAlloc, GlobalFrameAlloc};
use crate::runtime::{Builder, JobSystem};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// A system sized for the end-to-end scenarios.
pub(crate) fn test_system(workers: usize) -> JobSystem {
    init_tracing();
    Builder::new()
        .worker_threads(workers)
        .try_build()
        .expect("failed to build test system")
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Spins until `cond` holds, panicking after `timeout`.
#[track_caller]
pub(crate) fn spin_until(cond: impl Fn() -> bool, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() > deadline {
            panic!("condition not met within {timeout:?}");
        }
        std::thread::yield_now();
    }
}

pub(crate) const SPIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame allocator that counts live frames, for leak checks.
#[derive(Default)]
pub(crate) struct CountingAlloc {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl CountingAlloc {
    pub(crate) fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub(crate) fn live(&self) -> usize {
        self.allocated() - self.released.load(Ordering::Acquire)
    }
}

impl FrameAlloc for CountingAlloc {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        self.allocated.fetch_add(1, Ordering::AcqRel);
        GlobalFrameAlloc.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.released.fetch_add(1, Ordering::AcqRel);
        unsafe { GlobalFrameAlloc.deallocate(ptr, layout) }
    }
}
