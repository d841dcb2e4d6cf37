//! # Core Engine Module
//!
//! The in-process half of the multiplexer: everything between a transport
//! connection and the endpoints that consume a provider's rows.
//!
//! - **`multiplexer`**: the actor that owns every session, routes endpoint
//!   requests and enforces one upstream session per provider.
//! - **`session`**: one provider's cache, mode machine and subscriber set.
//! - **`batching`**: snapshot batching and realtime conflation by key.
//! - **`dispatcher`**: zero-copy fan-out to a session's subscribers.
//! - **`scheduler`**: cancel-and-reschedule timers for the flush paths.

#![forbid(unsafe_code)]

/// Snapshot batching and realtime conflation.
pub mod batching;
/// Zero-copy fan-out of responses to subscribed endpoints.
pub mod dispatcher;
/// The request router and session owner.
pub mod multiplexer;
/// Debounce and window timers.
pub mod scheduler;
/// Per-provider session state.
pub mod session;

pub use batching::{BatchConflator, BatchSettings, Flush, FlushKind};
pub use dispatcher::{EndpointSink, Fanout, Subscriber};
pub use multiplexer::{Multiplexer, MultiplexerHandle, MultiplexerSettings, MuxInput};
pub use scheduler::ScheduledTask;
pub use session::{Directed, ProviderSession};
