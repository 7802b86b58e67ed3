//! Reliability layer: retry with backoff and per-destination circuit breakers.

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerPermit, BreakerState, CircuitBreakers};
pub use retry::{Attempted, RetryPolicy};
