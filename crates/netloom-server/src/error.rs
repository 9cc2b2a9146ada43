//! Server error types.
//!
//! Server and acceptor level failures are reported as [`ServerError`] and are
//! never fatal to the process. Per-session I/O errors never show up here: they
//! are delivered to the send completion as a plain [`std::io::Result`] and
//! close only the session that hit them.

use thiserror::Error;

/// Errors returned by the pool, acceptor, server and datagram socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    /// Configuration error (invalid listen address, unusable pool size, etc.).
    ///
    /// Fatal for `start()`. Fix the configuration and start again; the server
    /// is left fully stopped.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error (bind/listen failure, accept failure, I/O error).
    ///
    /// May be transient (accept hit a descriptor limit) or fatal for
    /// `start()` (address already in use).
    #[error("transport error: {0}")]
    Transport(String),

    /// Resource exhaustion while starting (thread or runtime creation failed).
    ///
    /// Anything that was already running is unwound before this is returned.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Lifecycle misuse (start while started, stop from a loop thread, etc.).
    ///
    /// The call is a no-op; the component keeps its current state.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Errors returned when a buffer cannot be queued for transmission.
///
/// When `enqueue` fails the completion is dropped without being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The pipeline was closed; the peer is going away.
    #[error("send pipeline is closed")]
    Closed,

    /// The pending queue reached its configured limit.
    #[error("send queue is full ({limit} pending)")]
    QueueFull {
        /// Configured maximum number of pending entries.
        limit: usize,
    },

    /// The server is not started.
    #[error("server is not started")]
    Stopped,

    /// A connected send on a datagram socket that has no peer.
    #[error("datagram socket is not connected")]
    NotConnected,
}
