//! Listening socket and accept loop.
//!
//! The acceptor owns the listening socket. Its accept loop runs on loop 0 of
//! the pool and hands every accepted connection to a loop chosen by the pool's
//! selection policy, where it becomes a [`Session`].
//!
//! Stopping is synchronous: `stop()` signals the accept loop and blocks until
//! the loop confirms that it has released the listening socket. The
//! confirmation is single-fire and also resolves if the loop is torn down
//! before it can answer, so a stop racing with pool shutdown never hangs.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU8, Ordering},
        mpsc,
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

use crate::{
    config::ServerConfig,
    error::ServerError,
    pool::{EventLoopPool, LoopHandle},
    session::{Session, SessionContext},
    transport::{bind_listener, resolve_address},
};

/// Pause after a failed accept (descriptor exhaustion and similar).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Acceptor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcceptorState {
    /// Not listening
    Stopped = 0,
    /// Binding the listening socket
    Starting = 1,
    /// Accept loop running
    Started = 2,
    /// Waiting for the accept loop to confirm it stopped
    Stopping = 3,
}

impl AcceptorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Handles to a running accept loop.
struct Running {
    addr: SocketAddr,
    pool: Arc<EventLoopPool>,
    stop: oneshot::Sender<()>,
    stopped: mpsc::Receiver<()>,
    _pin: LoopHandle,
}

/// Accepts connections and turns them into sessions.
pub struct Acceptor {
    config: ServerConfig,
    state: AtomicU8,
    running: Mutex<Option<Running>>,
    // Serialises concurrent stop() calls so each returns only once stopped.
    stopping: Mutex<()>,
}

impl Acceptor {
    /// Create a stopped acceptor for `config.listen_address`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(AcceptorState::Stopped as u8),
            running: Mutex::new(None),
            stopping: Mutex::new(()),
        }
    }

    /// Bind the listening socket and start the accept loop on loop 0.
    ///
    /// Fails with [`ServerError::Lifecycle`] if already started or if the pool
    /// is not running, [`ServerError::Config`] if the address does not
    /// resolve, and [`ServerError::Transport`] if bind or listen fails. On
    /// failure the acceptor stays stopped.
    pub(crate) fn start(
        &self,
        pool: &Arc<EventLoopPool>,
        ctx: &Arc<SessionContext>,
    ) -> Result<SocketAddr, ServerError> {
        if !self.transition(AcceptorState::Stopped, AcceptorState::Starting) {
            return Err(ServerError::Lifecycle("acceptor is already started".into()));
        }

        match self.open(pool, ctx) {
            Ok(addr) => {
                self.set_state(AcceptorState::Started);
                tracing::info!(addr = %addr, "acceptor listening");
                Ok(addr)
            },
            Err(e) => {
                self.set_state(AcceptorState::Stopped);
                Err(e)
            },
        }
    }

    fn open(
        &self,
        pool: &Arc<EventLoopPool>,
        ctx: &Arc<SessionContext>,
    ) -> Result<SocketAddr, ServerError> {
        let addr = resolve_address(&self.config.listen_address)?;
        let pin = pool
            .pin(0)
            .ok_or_else(|| ServerError::Lifecycle("event loop pool is not running".into()))?;

        let listener = {
            let _enter = pin.handle().enter();
            bind_listener(addr, self.config.backlog, self.config.reuse_address)?
        };
        let local = listener.local_addr()?;

        let (stop, stop_rx) = oneshot::channel();
        let (stopped_tx, stopped) = mpsc::sync_channel(1);
        let accept_loop = AcceptLoop {
            listener,
            pool: Arc::clone(pool),
            ctx: Arc::clone(ctx),
            max_sessions: self.config.max_sessions,
        };
        pin.handle().spawn(accept_loop.run(stop_rx, stopped_tx));

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Running { addr: local, pool: Arc::clone(pool), stop, stopped, _pin: pin });
        Ok(local)
    }

    /// Stop accepting and wait for the accept loop to release the socket.
    ///
    /// No-op when already stopped. Fails without side effects when called
    /// from one of the pool's loop threads, where waiting would deadlock.
    /// Sessions that were already accepted are not touched.
    pub fn stop(&self) -> Result<(), ServerError> {
        let _serial = self.stopping.lock().unwrap_or_else(PoisonError::into_inner);

        let running = {
            let mut guard = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(running) = guard.as_ref() else {
                return Ok(());
            };
            if running.pool.on_loop_thread() {
                return Err(ServerError::Lifecycle(
                    "acceptor cannot be stopped from an event loop thread".into(),
                ));
            }
            guard.take()
        };
        let Some(running) = running else {
            return Ok(());
        };

        self.set_state(AcceptorState::Stopping);
        // Fails only if the accept loop is already gone.
        let _ = running.stop.send(());
        // Errs when the loop was torn down without answering; stopped either way.
        let _ = running.stopped.recv();
        self.set_state(AcceptorState::Stopped);

        tracing::info!(addr = %running.addr, "acceptor stopped");
        Ok(())
    }

    /// Bound listening address while started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.addr)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AcceptorState {
        AcceptorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the accept loop is running.
    pub fn is_started(&self) -> bool {
        self.state() == AcceptorState::Started
    }

    /// Whether the acceptor is fully stopped.
    pub fn is_stopped(&self) -> bool {
        self.state() == AcceptorState::Stopped
    }

    fn transition(&self, from: AcceptorState, to: AcceptorState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, state: AcceptorState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("acceptor dropped on an event loop thread: {}", e);
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("listen_address", &self.config.listen_address)
            .field("state", &self.state())
            .field("listen_addr", &self.listen_addr())
            .finish()
    }
}

/// The accept task running on loop 0.
struct AcceptLoop {
    listener: TcpListener,
    pool: Arc<EventLoopPool>,
    ctx: Arc<SessionContext>,
    max_sessions: Option<usize>,
}

impl AcceptLoop {
    async fn run(self, mut stop: oneshot::Receiver<()>, stopped: mpsc::SyncSender<()>) {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        self.ctx.handler.on_error(&ServerError::Transport(format!(
                            "accept failed: {e}"
                        )));
                        tokio::select! {
                            biased;
                            _ = &mut stop => break,
                            () = tokio::time::sleep(ACCEPT_BACKOFF) => {},
                        }
                    },
                },
            }
        }

        drop(self);
        // The stopper may have given up waiting already.
        let _ = stopped.send(());
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if let Some(max) = self.max_sessions {
            let live = self.ctx.registry.upgrade().map_or(0, |registry| registry.count());
            if live >= max {
                tracing::warn!(
                    addr = %peer,
                    max_sessions = max,
                    "session limit reached, dropping connection"
                );
                return;
            }
        }

        let Some(pin) = self.pool.select() else {
            tracing::debug!(addr = %peer, "event loop pool stopping, dropping connection");
            return;
        };

        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(addr = %peer, "failed to detach accepted stream: {}", e);
                return;
            },
        };

        if let Err(e) = Session::spawn(stream, peer, pin, &self.ctx) {
            tracing::warn!(addr = %peer, "failed to start session: {}", e);
            self.ctx.handler.on_error(&ServerError::from(e));
        }
    }
}
