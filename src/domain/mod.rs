//! Built-in services
//!
//! Provides the registry catalog fed by the discovery watch.

pub mod catalog;
