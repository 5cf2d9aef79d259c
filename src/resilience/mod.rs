//! # Resilience Module
//!
//! Backoff-based retry for transient store failures. The claim poller retries
//! without a deadline; the retention and timeout sweeps bound retries by their
//! sweep budget.

pub mod retry;

pub use retry::retry_with_backoff;
