//! Service discovery watch client
//!
//! Provides the dialer capability, endpoint parsing and the long-lived, retried prefix watch.

pub mod dialer;
pub mod endpoint;
pub mod watcher;
