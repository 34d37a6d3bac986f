//! Live delivery of room snapshots.
//!
//! There is no pub/sub underneath: the server side ([`session`]) holds one
//! loop per open connection that re-reads the store and forwards changes,
//! and the client side ([`viewer`]) falls back to plain polling when that
//! stream cannot be established or breaks.

pub mod session;
pub mod sse;
pub mod viewer;

pub use session::{LiveSession, StreamSettings};
pub use sse::{SseDecoder, SseFrame};
pub use viewer::{ViewTransport, Viewer, ViewerSettings};

use std::time::Duration;
use view_api::Snapshot;

/// Lifecycle of one subscription.
///
/// `Connecting -> Streaming -> (Degraded -> Polling) -> Closed`. The server
/// side only ever passes through `Connecting`, `Streaming` and `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Streaming,
    Degraded,
    Polling,
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The consumer went away or cancelled explicitly.
    Cancelled,
    /// The session hit its lifetime cap.
    IdleTimeout,
    TransportError,
}

/// One unit of output from a server-side session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    /// Reconnect delay advertised to the client.
    Retry(Duration),
    Snapshot(Snapshot),
    /// Keeps intermediaries from timing out an idle connection.
    Heartbeat(i64),
}
