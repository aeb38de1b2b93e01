//! FlexPool worker pool core
//!
//! This crate provides the auto-scaling worker pool:
//! - WorkerPool: worker lifecycle, manual scaling, and shutdown paths
//! - scaler: periodic load-driven scaling loop with hysteresis
//! - BlockingExecutor: bounded hand-off for blocking jobs

pub mod error;
pub mod executor;
pub mod pool;
pub mod scaler;

pub use error::PoolError;
pub use executor::BlockingExecutor;
pub use pool::WorkerPool;
pub use scaler::decide_delta;

pub type Result<T> = std::result::Result<T, PoolError>;
