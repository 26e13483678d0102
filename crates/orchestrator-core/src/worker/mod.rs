//! Worker pool: N concurrent dispatcher loops over one task queue, with
//! load-aware backpressure and watch-channel graceful shutdown.
//!
//! # Example
//!
//! ```ignore
//! use orchestrator_core::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let pool = Arc::new(WorkerPool::new(dispatcher, namespace_id, WorkerPoolConfig::new(20)));
//! pool.start()?;
//! // ... later
//! pool.shutdown().await?;
//! ```

mod backpressure;
mod pool;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
