//! Policy abstractions for dispatch operations.
//!
//! - [`RetryPolicy`]: bounded exponential backoff around any fallible async operation

pub mod retry;

pub use retry::RetryPolicy;
