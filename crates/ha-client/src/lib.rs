//! WebSocket transport session for the remote state source
//!
//! Connects, authenticates, correlates requests with responses by a
//! per-session message ID, keeps the connection alive with pings, and
//! reconnects with exponential backoff when it drops. State-change events
//! are fanned out per entity to subscribers registered on the [`Client`].

mod backoff;
mod client;
mod session;
pub mod types;

pub use backoff::Backoff;
pub use client::Client;
pub use types::{IncomingMessage, Request, ServiceTarget};
