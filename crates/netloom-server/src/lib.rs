//! Netloom network server engine.
//!
//! Accepts TCP connections (or receives UDP datagrams), spreads the peers over
//! a small pool of single-threaded event loops, and guarantees that data
//! queued for a peer goes out in submission order with at most one write in
//! flight.
//!
//! # Architecture
//!
//! ```text
//! Server ──start()──> EventLoopPool::run() ──> Acceptor::start()
//!
//! accept ──> Session (pinned to one loop) ──> SessionRegistry::insert
//!              │
//!              ├── read loop ──> SessionHandler::on_recv
//!              └── SendPipeline ──> one write at a time ──> completion
//! ```
//!
//! # Components
//!
//! - [`EventLoopPool`]: N current-thread runtimes, one OS thread each
//! - [`SendPipeline`]: ordered send queue, generic over stream and datagram
//!   transports
//! - [`Session`]: one connected peer and its lifecycle
//! - [`SessionRegistry`]: concurrent map of live sessions
//! - [`Acceptor`]: listening socket with a blocking, race-free `stop()`
//! - [`Server`]: start/stop orchestration and broadcast
//! - [`DatagramSocket`]: connectionless socket with per-send destinations

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod acceptor;
pub mod buffer;
pub mod config;
pub mod datagram;
mod error;
pub mod handler;
pub mod pipeline;
pub mod pool;
pub mod registry;
mod server;
pub mod session;
pub mod transport;

pub use acceptor::{Acceptor, AcceptorState};
pub use buffer::{Buffer, BufferAllocator, HeapAllocator};
pub use config::{
    DatagramConfig, LoopSelection, PoolSize, SendMode, ServerConfig, default_pool_size,
};
pub use datagram::DatagramSocket;
pub use error::{SendError, ServerError};
pub use handler::{DatagramHandler, NoopHandler, SessionHandler};
pub use pipeline::{Completion, SendPipeline, Transmit, TransportKind};
pub use pool::{EventLoopPool, LoopHandle};
pub use registry::{Registered, Registry, SessionRegistry};
pub use server::Server;
pub use session::{Session, SessionId, SessionState};
