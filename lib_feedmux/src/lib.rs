//! # lib_feedmux
//!
//! Multiplexed snapshot-then-stream ingestion. Many endpoints subscribe to a
//! provider; the multiplexer opens exactly one pub/sub session for it,
//! requests a bulk snapshot, keeps a keyed row cache current from the
//! realtime stream and fans batched, conflated output out to every
//! subscriber.

// Declare the modules
pub mod client;
pub mod core;
pub mod error;
pub mod model;
pub mod transport;
#[cfg(feature = "utils")]
pub mod utils;

// Re-export the public surface
pub use crate::client::{ClientEvent, ClientHandle};
pub use crate::core::{Multiplexer, MultiplexerHandle, MultiplexerSettings};
pub use crate::error::{ErrorBody, FeedError, Result};
pub use crate::model::{
    ProviderConfig, Request, RequestType, Response, ResponseType, Row, SessionMode, Statistics,
};
pub use crate::transport::{Link, LinkFactory, LinkFrame, TransportEvent};
#[cfg(feature = "ws")]
pub use crate::transport::StompWsLinkFactory;
