//! # Data Model
//!
//! Plain data shared by every layer: provider configuration, rows, the
//! request/response envelopes, and session statistics. Nothing in here
//! performs I/O.

/// Provider configuration and per-session topic resolution.
pub mod config;
/// Request and response envelopes.
pub mod envelope;
/// Schema-less rows, key extraction and frame decoding.
pub mod row;
/// Session mode and statistics.
pub mod stats;

pub use config::{ProviderConfig, ResolvedTopics};
pub use envelope::{Request, RequestType, Response, ResponseType};
pub use row::{parse_rows, row_key, Row};
pub use stats::{BytesReceived, SessionMode, Statistics};
