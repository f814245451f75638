//! JSON-RPC 2.0 request pipeline
//!
//! Provides message parsing, method registration, concurrent dispatch with a completion
//! barrier, and the single-writer send path used by the TCP transport.

pub mod barrier;
pub mod dispatcher;
pub mod event;
pub mod message;
pub mod registry;
pub mod send_loop;
