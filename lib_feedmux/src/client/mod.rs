//! # Client Module
//!
//! The endpoint-side API: attach to a running multiplexer, issue correlated
//! requests and receive provider broadcasts as events.

#![forbid(unsafe_code)]

/// Request correlation and broadcast redispatch for one endpoint.
pub mod handle;

pub use handle::{ClientEvent, ClientHandle, DEFAULT_REQUEST_TIMEOUT};
