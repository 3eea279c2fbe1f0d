//! Drivers that take ready jobs through lease, run and outcome handling.
//!
//! - [`JobRunner`]: one job at a time in the calling thread
//! - [`PoolRunner`]: jobs dispatched to worker subprocesses from an event loop

pub mod pool;
pub mod sync;

pub use pool::PoolRunner;
pub use sync::JobRunner;
