//! ircnotifyd core
//!
//! This crate provides the dispatch and connection-management engine for
//! the ircnotifyd notification relay: inbound listening and validation,
//! the shared per-server connection pool, the IRC client state machine,
//! and per-channel rate limiting.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod message;
pub mod notification;
pub mod pool;
pub mod rate_limiter;
pub mod target;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use connection::{ConnCommand, ConnectionHandle, ConnectionState, Delivery};
pub use daemon::Daemon;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use listener::Listener;
pub use message::{privmsg_chunks, Command, Message, Prefix, MAX_LINE_LEN};
pub use notification::Notification;
pub use pool::ConnectionPool;
pub use rate_limiter::{RateLimiter, TokenDecision};
pub use target::{ConnectionKey, Target};

/// Re-exports for convenience
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, error, info, warn};
