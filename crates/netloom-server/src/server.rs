//! Stream server.
//!
//! [`Server`] ties the pieces together: an [`EventLoopPool`], the
//! [`SessionRegistry`] and an [`Acceptor`]. It is the only type most
//! applications need.
//!
//! # Shutdown
//!
//! `stop()` runs in a fixed order:
//!
//! 1. stop the acceptor and wait until no accept can complete any more;
//! 2. stop the pool, which tears down every loop and joins its thread;
//!    sessions still open are finalised as their loop goes away;
//! 3. clear the registry.
//!
//! Sessions are not closed gracefully first. Callers that want queued data
//! flushed close them through [`Server::for_each_session`] before stopping.
//!
//! Both `start()` and `stop()` block, and `stop()` refuses to run on one of
//! the server's own loop threads. From async code, call it through
//! `tokio::task::spawn_blocking`.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    acceptor::Acceptor,
    buffer::{Buffer, BufferAllocator, HeapAllocator},
    config::ServerConfig,
    error::{SendError, ServerError},
    handler::SessionHandler,
    pool::EventLoopPool,
    registry::SessionRegistry,
    session::{Session, SessionContext, SessionId},
};

/// A TCP server multiplexing sessions over a pool of event loops.
pub struct Server {
    pool: Arc<EventLoopPool>,
    registry: Arc<SessionRegistry>,
    ctx: Arc<SessionContext>,
    acceptor: Acceptor,
    lifecycle: Mutex<()>,
    last_error: Mutex<Option<ServerError>>,
}

impl Server {
    /// Create a stopped server.
    pub fn new(config: ServerConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Self::with_allocator(config, handler, Arc::new(HeapAllocator))
    }

    /// Create a stopped server whose sessions take read buffers from
    /// `allocator`.
    pub fn with_allocator(
        config: ServerConfig,
        handler: Arc<dyn SessionHandler>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Self {
        let pool = Arc::new(EventLoopPool::new(config.pool_size, config.loop_selection));
        let registry = Arc::new(SessionRegistry::new());
        let ctx = Arc::new(SessionContext {
            handler,
            registry: Arc::downgrade(&registry),
            allocator,
            send_mode: config.send_mode,
            send_queue_limit: config.send_queue_limit,
            read_buffer_size: config.read_buffer_size,
            no_delay: config.no_delay,
        });
        let acceptor = Acceptor::new(config);

        Self {
            pool,
            registry,
            ctx,
            acceptor,
            lifecycle: Mutex::new(()),
            last_error: Mutex::new(None),
        }
    }

    /// Start the pool, then the acceptor.
    ///
    /// Rejected with [`ServerError::Lifecycle`] when already started. A
    /// leftover from an earlier failed start is cleaned up first. If the
    /// acceptor cannot start, the pool is stopped again and the server is
    /// left fully stopped. Every failure is also kept as
    /// [`Server::last_error`].
    pub fn start(&self) -> Result<(), ServerError> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);

        if self.acceptor.is_started() {
            return Err(self.record(ServerError::Lifecycle("server is already started".into())));
        }

        self.shutdown().map_err(|e| self.record(e))?;
        self.pool.run().map_err(|e| self.record(e))?;

        if let Err(e) = self.acceptor.start(&self.pool, &self.ctx) {
            tracing::error!("failed to start acceptor: {}", e);
            if let Err(stop_err) = self.pool.stop() {
                tracing::warn!("failed to unwind event loop pool: {}", stop_err);
            }
            return Err(self.record(e));
        }

        tracing::info!(
            addr = %self.listen_address(),
            pool_size = self.pool.size(),
            "server started"
        );
        Ok(())
    }

    /// Stop accepting, tear down the loops and forget every session.
    ///
    /// No-op when already stopped. Fails with [`ServerError::Lifecycle`]
    /// when called from one of the server's loop threads.
    pub fn stop(&self) -> Result<(), ServerError> {
        if self.pool.on_loop_thread() {
            return Err(self.record(ServerError::Lifecycle(
                "server cannot be stopped from one of its event loops".into(),
            )));
        }

        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        let was_running = self.pool.is_running();
        self.shutdown().map_err(|e| self.record(e))?;
        if was_running {
            tracing::info!("server stopped");
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), ServerError> {
        self.acceptor.stop()?;
        self.pool.stop()?;

        let leftover = self.registry.clear();
        if !leftover.is_empty() {
            tracing::debug!(count = leftover.len(), "dropped sessions left after pool shutdown");
        }
        Ok(())
    }

    fn record(&self, error: ServerError) -> ServerError {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
        error
    }

    /// Whether the server is accepting connections.
    pub fn is_started(&self) -> bool {
        self.acceptor.is_started()
    }

    /// Whether the server is fully stopped.
    pub fn is_stopped(&self) -> bool {
        self.acceptor.is_stopped()
    }

    /// Queue `data` on every registered session.
    ///
    /// Best effort: a session whose pipeline is closed or full is skipped.
    /// Returns the number of sessions the buffer was queued on, or
    /// [`SendError::Stopped`] when the server is not started.
    pub fn send(&self, data: Buffer) -> Result<usize, SendError> {
        if !self.is_started() {
            return Err(SendError::Stopped);
        }

        let mut queued = 0;
        self.registry.for_each(|session| match session.send(data.clone()) {
            Ok(()) => queued += 1,
            Err(e) => tracing::trace!(session = %session.id(), "broadcast skipped: {}", e),
        });
        Ok(queued)
    }

    /// Queue `data` on the session with `id`.
    ///
    /// [`SendError::Stopped`] when the server is not started,
    /// [`SendError::Closed`] when no such session is registered.
    pub fn send_to_session(&self, id: SessionId, data: Buffer) -> Result<(), SendError> {
        if !self.is_started() {
            return Err(SendError::Stopped);
        }
        self.registry.get(id).ok_or(SendError::Closed)?.send(data)
    }

    /// Listening IP address, or an empty string when not started.
    pub fn listen_address(&self) -> String {
        self.local_addr().map(|addr| addr.ip().to_string()).unwrap_or_default()
    }

    /// Listening port, or 0 when not started.
    pub fn listen_port(&self) -> u16 {
        self.local_addr().map_or(0, |addr| addr.port())
    }

    /// Bound listening address while started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if self.is_started() { self.acceptor.listen_addr() } else { None }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Visit every live session. Returns `false` without visiting when the
    /// server is not started.
    pub fn for_each_session<F>(&self, visitor: F) -> bool
    where
        F: FnMut(&Arc<Session>),
    {
        if !self.is_started() {
            return false;
        }
        self.registry.for_each(visitor);
        true
    }

    /// First live session matching `predicate`. `None` when not started.
    pub fn find_session_if<P>(&self, predicate: P) -> Option<Arc<Session>>
    where
        P: FnMut(&Arc<Session>) -> bool,
    {
        if !self.is_started() {
            return None;
        }
        self.registry.find_first(predicate)
    }

    /// Live session with `id`.
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    /// Most recent start or stop failure.
    pub fn last_error(&self) -> Option<ServerError> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The server's event-loop pool.
    ///
    /// Datagram sockets can be bound on it to share the server's loops.
    pub fn pool(&self) -> &Arc<EventLoopPool> {
        &self.pool
    }

    /// The server's session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("server dropped on one of its event loops: {}", e);
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("acceptor", &self.acceptor)
            .field("pool", &self.pool)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PoolSize, handler::NoopHandler};

    fn server() -> Server {
        let config = ServerConfig { pool_size: PoolSize::Fixed(2), ..ServerConfig::default() };
        Server::new(config, Arc::new(NoopHandler))
    }

    #[test]
    fn queries_are_empty_while_stopped() {
        let server = server();

        assert!(server.is_stopped());
        assert!(!server.is_started());
        assert_eq!(server.listen_address(), "");
        assert_eq!(server.listen_port(), 0);
        assert_eq!(server.session_count(), 0);
        assert!(!server.for_each_session(|_| {}));
        assert!(server.find_session_if(|_| true).is_none());
        assert_eq!(server.send(Buffer::from_static(b"x")), Err(SendError::Stopped));
    }

    #[test]
    fn stop_without_start_is_noop() {
        let server = server();
        server.stop().unwrap();
        server.stop().unwrap();
        assert!(server.last_error().is_none());
    }

    #[test]
    fn double_start_is_rejected_and_recorded() {
        let server = server();
        server.start().unwrap();
        let port = server.listen_port();
        assert_ne!(port, 0);
        assert_eq!(server.listen_address(), "127.0.0.1");

        let err = server.start().unwrap_err();
        assert!(matches!(err, ServerError::Lifecycle(_)));
        assert_eq!(server.last_error(), Some(err));
        assert!(server.is_started());
        assert_eq!(server.listen_port(), port);

        server.stop().unwrap();
        assert!(server.is_stopped());
        assert!(!server.pool().is_running());
    }

    #[test]
    fn failed_bind_leaves_server_stopped() {
        let config = ServerConfig {
            listen_address: "not an address".into(),
            pool_size: PoolSize::Fixed(1),
            ..ServerConfig::default()
        };
        let server = Server::new(config, Arc::new(NoopHandler));

        assert!(matches!(server.start(), Err(ServerError::Config(_))));
        assert!(server.is_stopped());
        assert!(!server.pool().is_running());
        assert!(matches!(server.last_error(), Some(ServerError::Config(_))));
    }

    #[test]
    fn restart_after_stop() {
        let server = server();
        server.start().unwrap();
        server.stop().unwrap();
        server.start().unwrap();
        assert!(server.is_started());
        assert_ne!(server.listen_port(), 0);
        server.stop().unwrap();
    }
}
