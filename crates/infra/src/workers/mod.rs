//! Worker pools for blocking work.

pub mod blocking_pool;

pub use blocking_pool::{BlockingPool, BlockingPoolConfig, PoolError, PoolStats};
