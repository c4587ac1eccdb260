//! Suspension points for coroutine jobs.
//!
//! A coroutine suspends in exactly two ways: waiting for the completion of
//! child jobs ([`all`], or awaiting a [`Coro`] / [`FnJob`] directly), and
//! moving itself to another worker ([`resume_on`]). Each awaitable spawns
//! its work on the first poll, returns `Poll::Pending` once, and is resumed
//! by the completion protocol - no wakers involved.
//!
//! [`Coro`]: crate::Coro
//! [`FnJob`]: crate::FnJob

use crate::context;
use crate::job::coro::Coro;
use crate::job::function::FnJob;
use crate::job::raw::RawJob;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

/// Awaits a fan-out of child jobs and collects their values.
///
/// Accepts a single [`Coro`]/[`FnJob`], a `Vec` of them, or a tuple mixing
/// such containers; the output mirrors the input shape. An empty container
/// completes without suspending.
///
/// ```no_run
/// # use jobble::{all, Coro};
/// # async fn demo() {
/// let children: Vec<Coro<i64>> = (0..4).map(|i| Coro::new(async move { i })).collect();
/// let sum: i64 = all(children).await.into_iter().sum();
/// # }
/// ```
///
/// [`Coro`]: crate::Coro
/// [`FnJob`]: crate::FnJob
pub fn all<S: AwaitSet>(children: S) -> AwaitChildren<S> {
    AwaitChildren {
        set: Some(children),
        spawned: false,
    }
}

/// Moves the current coroutine to worker `index`.
///
/// Rewrites the job's affinity and re-enqueues it on the target worker.
/// When `index` is already the current worker the suspension is elided: no
/// queue round-trip happens.
pub fn resume_on(index: usize) -> ResumeOn {
    ResumeOn {
        index,
        rescheduled: false,
    }
}

/// A fan-out shape accepted by [`all`]: one child, a container of children,
/// or a tuple of containers.
pub trait AwaitSet {
    /// What the await yields once every child's subtree completed.
    type Output;

    #[doc(hidden)]
    fn count(&self) -> usize;

    /// Links and enqueues every child under the job currently running on
    /// this worker. The parent's counter has already been raised by
    /// [`count`](AwaitSet::count).
    #[doc(hidden)]
    fn spawn(&mut self);

    /// Harvests the children's results after subtree completion.
    #[doc(hidden)]
    fn finish(self) -> Self::Output;
}

fn spawn_child(raw: RawJob) {
    context::expect_worker("await child jobs", |ctx| {
        let parent = ctx.current.get().expect("no job running on this worker");
        ctx.handle.submit_linked(raw, Some(parent));
    });
}

impl<T: Send + 'static> AwaitSet for Coro<T> {
    type Output = T;

    fn count(&self) -> usize {
        1
    }

    fn spawn(&mut self) {
        spawn_child(self.raw());
    }

    fn finish(self) -> T {
        debug_assert!(self.raw().header().done.load(Ordering::Acquire));
        self.take_value()
    }
}

impl AwaitSet for FnJob {
    type Output = ();

    fn count(&self) -> usize {
        1
    }

    fn spawn(&mut self) {
        spawn_child(self.raw());
    }

    fn finish(self) {}
}

impl<S: AwaitSet> AwaitSet for Vec<S> {
    type Output = Vec<S::Output>;

    fn count(&self) -> usize {
        self.iter().map(S::count).sum()
    }

    fn spawn(&mut self) {
        for child in self.iter_mut() {
            child.spawn();
        }
    }

    fn finish(self) -> Vec<S::Output> {
        self.into_iter().map(S::finish).collect()
    }
}

macro_rules! await_set_tuple {
    ($($name:ident),+) => {
        #[allow(non_snake_case)]
        impl<$($name: AwaitSet),+> AwaitSet for ($($name,)+) {
            type Output = ($($name::Output,)+);

            fn count(&self) -> usize {
                let ($($name,)+) = self;
                0 $(+ $name.count())+
            }

            fn spawn(&mut self) {
                let ($($name,)+) = self;
                $($name.spawn();)+
            }

            fn finish(self) -> Self::Output {
                let ($($name,)+) = self;
                ($($name.finish(),)+)
            }
        }
    };
}

await_set_tuple!(A, B);
await_set_tuple!(A, B, C);
await_set_tuple!(A, B, C, D);

/// Future returned by [`all`].
pub struct AwaitChildren<S: AwaitSet> {
    set: Option<S>,
    spawned: bool,
}

// The set is never pin-projected; children live in their own frames.
impl<S: AwaitSet> Unpin for AwaitChildren<S> {}

impl<S: AwaitSet> Future for AwaitChildren<S> {
    type Output = S::Output;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<S::Output> {
        let this = self.get_mut();

        if !this.spawned {
            let set = this.set.as_mut().expect("children awaited twice");
            let count = set.count();
            if count == 0 {
                // Nothing to wait for: the await is a no-op.
                return Poll::Ready(this.set.take().expect("children awaited twice").finish());
            }

            // Raise the parent's counter by the whole fan-out before any
            // child becomes visible.
            context::expect_worker("await child jobs", |ctx| {
                let parent = ctx.current.get().expect("no job running on this worker");
                parent
                    .header()
                    .children
                    .fetch_add(count as i32, Ordering::Relaxed);
            });
            set.spawn();
            this.spawned = true;
            return Poll::Pending;
        }

        Poll::Ready(this.set.take().expect("children awaited twice").finish())
    }
}

/// Future returned by [`resume_on`].
pub struct ResumeOn {
    index: usize,
    rescheduled: bool,
}

impl Future for ResumeOn {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.rescheduled {
            return Poll::Ready(());
        }

        context::expect_worker("change worker", |ctx| {
            if ctx.index == this.index {
                return Poll::Ready(());
            }

            let current = ctx.current.get().expect("no job running on this worker");
            current.header().affinity.set(Some(this.index));
            current.header().moved.set(true);
            this.rescheduled = true;
            Poll::Pending
        })
    }
}
