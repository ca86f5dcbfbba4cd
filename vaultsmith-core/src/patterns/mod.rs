//! Reusable control-flow patterns

pub mod retry;

pub use retry::{retry, BackoffStrategy, RetryConfig};
