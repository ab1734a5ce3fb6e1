//! Common utilities and helper functions
//!
//! This module provides shared utilities used across the cluster and queue layers.

pub mod retry;

pub use retry::{with_retry_if, RetryConfig};
