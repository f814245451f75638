//! HTTP transport for the JSON-RPC dispatcher
//!
//! Provides the external API routing, including the `/` JSON-RPC listener and metadata endpoints.

pub mod handlers;
