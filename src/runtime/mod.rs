//! The scheduler: configuration, shared state, the worker pool, and the
//! process-wide singleton.

pub(crate) mod builder;
pub use builder::Builder;

mod pool;

pub(crate) mod system;
pub use system::{
    Handle, JobSystem, Schedulable, init, instance, reset_instance, schedule, terminate,
    wait_for_termination,
};

pub(crate) mod worker;

#[cfg(test)]
mod tests;
