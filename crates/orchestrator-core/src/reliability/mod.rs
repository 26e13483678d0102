//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`TimeoutManager`] - Schedule-to-start/start-to-close/heartbeat timeout checks

mod retry;
mod timeout;

pub use retry::RetryPolicy;
pub use timeout::{TaskTimingInfo, TimeoutConfig, TimeoutError, TimeoutManager, TimeoutType};
