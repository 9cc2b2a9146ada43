//! Application callbacks.
//!
//! Handlers run on the event loop of the session or socket they concern. They
//! must not block that loop for long, and they must not call the blocking
//! `stop()` methods.

use std::{io, net::SocketAddr, sync::Arc};

use crate::{buffer::Buffer, datagram::DatagramSocket, error::ServerError, session::Session};

/// Callbacks for stream sessions. Every method defaults to a no-op.
pub trait SessionHandler: Send + Sync + 'static {
    /// A connection was accepted and registered. The session is still
    /// `Connecting`; it becomes `Connected` right after this returns.
    fn on_accept(&self, session: &Arc<Session>) {
        let _ = session;
    }

    /// Bytes arrived on `session`.
    fn on_recv(&self, session: &Arc<Session>, data: Buffer) {
        let _ = (session, data);
    }

    /// A send on `session` completed with the number of bytes written or the
    /// write error.
    fn on_send(&self, session: &Arc<Session>, result: &io::Result<usize>) {
        let _ = (session, result);
    }

    /// `session` reached `Closed` and left the registry. Called exactly once
    /// per session.
    fn on_close(&self, session: &Arc<Session>) {
        let _ = session;
    }

    /// Acceptor or server level error.
    fn on_error(&self, error: &ServerError) {
        let _ = error;
    }
}

/// Callbacks for datagram sockets. Every method defaults to a no-op.
pub trait DatagramHandler: Send + Sync + 'static {
    /// A datagram from `from` arrived on `socket`.
    fn on_recv(&self, socket: &Arc<DatagramSocket>, data: Buffer, from: SocketAddr) {
        let _ = (socket, data, from);
    }

    /// A datagram to `dest` was sent or failed.
    fn on_send(&self, socket: &Arc<DatagramSocket>, dest: SocketAddr, result: &io::Result<usize>) {
        let _ = (socket, dest, result);
    }

    /// Receive error on `socket`.
    fn on_error(&self, error: &ServerError) {
        let _ = error;
    }
}

/// Handler that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl SessionHandler for NoopHandler {}

impl DatagramHandler for NoopHandler {}
