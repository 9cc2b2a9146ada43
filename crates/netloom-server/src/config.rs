//! Configuration for the pool, server and datagram sockets.
//!
//! Everything here is plain data with sensible defaults. Parsing URLs or config
//! files is left to the caller; the only string input understood here is the
//! raw event-loop pool size override, which follows the "0, absent or garbage
//! means default" rule.

use std::{num::NonZeroUsize, thread};

/// Default size of the per-session (or per-socket) read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Default listen address (ephemeral port on loopback).
pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:0";

/// Number of event loops when no usable override is configured:
/// hardware concurrency × 2.
pub fn default_pool_size() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get) * 2
}

/// Requested event-loop pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolSize {
    /// Hardware concurrency × 2.
    #[default]
    Auto,
    /// Exactly this many loops. `Fixed(0)` resolves like [`PoolSize::Auto`].
    Fixed(usize),
}

impl PoolSize {
    /// Interpret a raw override such as the `io_context_pool_size` parameter.
    ///
    /// Leading whitespace is skipped and the leading run of decimal digits is
    /// used, so `"8"` and `"8 loops"` both mean eight loops. A missing value,
    /// a value with no leading digits, zero, or a number that does not fit in
    /// `usize` all fall back to [`PoolSize::Auto`].
    pub fn from_param(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Auto;
        };

        let trimmed = raw.trim_start();
        let digits_end =
            trimmed.find(|c: char| !c.is_ascii_digit()).unwrap_or(trimmed.len());

        match trimmed[..digits_end].parse::<usize>() {
            Ok(0) | Err(_) => Self::Auto,
            Ok(n) => Self::Fixed(n),
        }
    }

    /// Concrete number of loops to create. Always at least one.
    pub fn resolve(self) -> usize {
        match self {
            Self::Fixed(n) if n > 0 => n,
            _ => default_pool_size(),
        }
    }
}

impl From<usize> for PoolSize {
    fn from(n: usize) -> Self {
        if n == 0 { Self::Auto } else { Self::Fixed(n) }
    }
}

/// Policy used to pin a new session or socket to a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopSelection {
    /// Cycle through the loops in order.
    #[default]
    RoundRobin,
    /// Pick the loop with the fewest live pins (ties go to the lowest index).
    LeastLoaded,
}

/// How a send pipeline dispatches writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendMode {
    /// One asynchronous write in flight at a time, driven by a task on the
    /// pinned loop.
    #[default]
    Queued,
    /// Write synchronously on the caller's thread and run the completion
    /// before `enqueue` returns. The caller blocks until the whole buffer has
    /// been handed to the kernel, so a slow peer stalls the sending thread.
    Inline,
}

/// Stream server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:8080").
    pub listen_address: String,
    /// Event-loop pool size.
    pub pool_size: PoolSize,
    /// Loop assignment policy for accepted sessions.
    pub loop_selection: LoopSelection,
    /// Send dispatch mode for every session.
    pub send_mode: SendMode,
    /// Size of the read buffer acquired per session.
    pub read_buffer_size: usize,
    /// Listen backlog.
    pub backlog: u32,
    /// Set `SO_REUSEADDR` on the listening socket.
    pub reuse_address: bool,
    /// Set `TCP_NODELAY` on accepted connections.
    pub no_delay: bool,
    /// Maximum number of live sessions. Connections beyond it are dropped.
    pub max_sessions: Option<usize>,
    /// Maximum pending sends per session before `send` reports a full queue.
    pub send_queue_limit: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            pool_size: PoolSize::Auto,
            loop_selection: LoopSelection::RoundRobin,
            send_mode: SendMode::Queued,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
            reuse_address: true,
            no_delay: true,
            max_sessions: None,
            send_queue_limit: None,
        }
    }
}

impl ServerConfig {
    /// Configuration listening on `listen_address` with everything else
    /// defaulted.
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self { listen_address: listen_address.into(), ..Self::default() }
    }
}

/// Datagram socket configuration.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    /// Local address to bind (e.g., "0.0.0.0:9000").
    pub bind_address: String,
    /// Send dispatch mode.
    pub send_mode: SendMode,
    /// Size of the receive buffer. Datagrams larger than this are truncated.
    pub read_buffer_size: usize,
    /// Maximum pending sends before `send_to` reports a full queue.
    pub send_queue_limit: Option<usize>,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            send_mode: SendMode::Queued,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            send_queue_limit: None,
        }
    }
}

impl DatagramConfig {
    /// Configuration bound to `bind_address` with everything else defaulted.
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self { bind_address: bind_address.into(), ..Self::default() }
    }
}
