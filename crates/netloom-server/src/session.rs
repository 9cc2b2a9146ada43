//! Stream sessions.
//!
//! A [`Session`] is one connected peer. It is pinned to one event loop for its
//! whole life: its read loop, its send pipeline's drain task and every handler
//! callback about it run on that loop's thread, so its state transitions never
//! race with each other.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐  accepted   ┌───────────┐  close()/EOF/error  ┌─────────┐
//! │ Connecting │────────────>│ Connected │────────────────────>│ Closing │
//! └────────────┘             └───────────┘                     └─────────┘
//!       │                                                           │
//!       │ close()                              read cancelled,      │
//!       └──────────────────────> Closing       pipeline drained     ↓
//!                                                              ┌────────┐
//!                                                              │ Closed │
//!                                                              └────────┘
//! ```
//!
//! A session is in the registry exactly while it is not `Closed`. Reaching
//! `Closed` removes it from the registry and calls
//! [`SessionHandler::on_close`] exactly once, including when the owning loop
//! is torn down with the session still open.
//!
//! # Lifetime
//!
//! Every asynchronous operation holds a strong handle: the read task owns one,
//! and each queued send captures one in its completion. The session stays
//! alive until the last of them has run or been dropped.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};

use tokio::{
    io::AsyncReadExt,
    net::{TcpStream, tcp::OwnedReadHalf},
    sync::Notify,
    task::JoinHandle,
};

use crate::{
    buffer::{Buffer, BufferAllocator, take_filled},
    config::SendMode,
    error::SendError,
    handler::SessionHandler,
    pipeline::{Completion, SendPipeline},
    pool::LoopHandle,
    registry::SessionRegistry,
    transport::StreamTx,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next id.
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw id (lookups by a previously observed id).
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Accepted and registered, read loop not started yet
    Connecting = 0,
    /// Reading and writing
    Connected = 1,
    /// Close requested or detected; read cancelled, pipeline draining
    Closing = 2,
    /// Terminal; no longer registered
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Everything a session needs from the server that created it.
pub(crate) struct SessionContext {
    pub(crate) handler: Arc<dyn SessionHandler>,
    pub(crate) registry: Weak<SessionRegistry>,
    pub(crate) allocator: Arc<dyn BufferAllocator>,
    pub(crate) send_mode: SendMode,
    pub(crate) send_queue_limit: Option<usize>,
    pub(crate) read_buffer_size: usize,
    pub(crate) no_delay: bool,
}

/// One connected peer.
pub struct Session {
    id: SessionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    pin: LoopHandle,
    state: AtomicU8,
    finished: AtomicBool,
    close_requested: Notify,
    pipeline: SendPipeline<StreamTx>,
    ctx: Arc<SessionContext>,
}

impl Session {
    /// Adopt an accepted connection on the loop `pin` points to.
    ///
    /// The stream is re-registered with the pinned loop's reactor, the session
    /// is registered in the `Connecting` state, and its read loop is spawned on
    /// the pinned loop.
    pub(crate) fn spawn(
        stream: std::net::TcpStream,
        peer_addr: SocketAddr,
        pin: LoopHandle,
        ctx: &Arc<SessionContext>,
    ) -> io::Result<Arc<Self>> {
        let handle = pin.handle().clone();
        let stream = {
            let _enter = handle.enter();
            TcpStream::from_std(stream)?
        };
        if let Err(e) = stream.set_nodelay(ctx.no_delay) {
            tracing::debug!(addr = %peer_addr, "failed to set TCP_NODELAY: {}", e);
        }
        let local_addr = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        let (pipeline, drain) = SendPipeline::new(
            &handle,
            StreamTx::new(writer),
            ctx.send_mode,
            ctx.send_queue_limit,
        );

        let session = Arc::new(Self {
            id: SessionId::next(),
            peer_addr,
            local_addr,
            pin,
            state: AtomicU8::new(SessionState::Connecting as u8),
            finished: AtomicBool::new(false),
            close_requested: Notify::new(),
            pipeline,
            ctx: Arc::clone(ctx),
        });

        if let Some(registry) = ctx.registry.upgrade() {
            registry.insert(Arc::clone(&session));
        }

        // Created before spawning so an unpolled, dropped task still finalises.
        let guard = FinishGuard(Arc::clone(&session));
        handle.spawn(Arc::clone(&session).run(guard, reader, drain));

        tracing::debug!(
            session = %session.id,
            addr = %peer_addr,
            loop_index = session.loop_index(),
            "session accepted"
        );
        Ok(session)
    }

    async fn run(
        self: Arc<Self>,
        _guard: FinishGuard,
        mut reader: OwnedReadHalf,
        drain: Option<JoinHandle<()>>,
    ) {
        self.ctx.handler.on_accept(&self);
        // Fails only if close() already moved us to Closing.
        let _ = self.transition(SessionState::Connecting, SessionState::Connected);

        let size = self.ctx.read_buffer_size;
        let mut buf = self.ctx.allocator.acquire(size);

        while self.state() == SessionState::Connected {
            tokio::select! {
                biased;
                () = self.close_requested.notified() => break,
                result = reader.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        tracing::debug!(session = %self.id, "peer closed the connection");
                        break;
                    },
                    Ok(_) => {
                        let data = take_filled(&mut buf, size);
                        self.ctx.handler.on_recv(&self, data);
                    },
                    Err(e) => {
                        tracing::warn!(session = %self.id, "read failed: {}", e);
                        break;
                    },
                },
            }
        }

        self.ctx.allocator.release(buf);
        self.begin_close();
        self.pipeline.close();
        if let Some(drain) = drain {
            // Only fails if the loop is being torn down.
            let _ = drain.await;
        }
        drop(reader);
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Index of the event loop this session is pinned to.
    pub fn loop_index(&self) -> usize {
        self.pin.index()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the session is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Sends queued or in flight on this session.
    pub fn pending_sends(&self) -> usize {
        self.pipeline.pending()
    }

    /// Queue `data` for transmission. See [`Session::send_with`].
    pub fn send(self: &Arc<Self>, data: Buffer) -> Result<(), SendError> {
        self.enqueue(data, None)
    }

    /// Queue `data` and run `on_complete` with the outcome.
    ///
    /// Returns without waiting for the write. Buffers are written in call
    /// order. The handler's `on_send` runs before `on_complete`; a write error
    /// starts closing the session, but buffers queued behind it are still
    /// attempted.
    pub fn send_with<F>(self: &Arc<Self>, data: Buffer, on_complete: F) -> Result<(), SendError>
    where
        F: FnOnce(io::Result<usize>) + Send + 'static,
    {
        self.enqueue(data, Some(Box::new(on_complete)))
    }

    fn enqueue(
        self: &Arc<Self>,
        data: Buffer,
        on_complete: Option<Completion>,
    ) -> Result<(), SendError> {
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            return Err(SendError::Closed);
        }

        let session = Arc::clone(self);
        let completion: Completion = Box::new(move |result: io::Result<usize>| {
            session.ctx.handler.on_send(&session, &result);
            if let Err(e) = &result {
                tracing::warn!(session = %session.id, "write failed: {}", e);
                session.close();
            }
            if let Some(on_complete) = on_complete {
                on_complete(result);
            }
        });
        self.pipeline.enqueue(data, (), Some(completion))
    }

    /// Request the session to close. Idempotent.
    ///
    /// The pending read is cancelled; an in-flight write is not, and buffers
    /// already queued are still attempted before the stream is shut down.
    pub fn close(&self) {
        if self.begin_close() {
            self.close_requested.notify_one();
        }
    }

    /// Move to `Closing` from `Connecting` or `Connected`.
    fn begin_close(&self) -> bool {
        let closing = self.transition(SessionState::Connected, SessionState::Closing)
            || self.transition(SessionState::Connecting, SessionState::Closing);
        if closing {
            tracing::debug!(session = %self.id, "session closing");
        }
        closing
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reach `Closed`: unregister and notify. Runs once.
    fn finish(self: &Arc<Self>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.begin_close();
        self.pipeline.close();

        if let Some(registry) = self.ctx.registry.upgrade() {
            registry.remove(self.id);
        }
        self.state.store(SessionState::Closed as u8, Ordering::Release);

        tracing::debug!(session = %self.id, addr = %self.peer_addr, "session closed");
        self.ctx.handler.on_close(self);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("loop_index", &self.loop_index())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Finalises its session when dropped, whether the read task ended normally
/// or was torn down with its loop.
struct FinishGuard(Arc<Session>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}
