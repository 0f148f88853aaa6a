//! Resilience primitives: retry with bounded exponential backoff.

pub mod retry;

pub use retry::{retry, retry_if, RetryConfig};
