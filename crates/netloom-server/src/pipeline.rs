//! Ordered send pipeline.
//!
//! Every session (and every datagram socket) owns one pipeline. Buffers are
//! transmitted in exactly the order they were enqueued, and at most one
//! transmission is outstanding at any instant.
//!
//! In [`SendMode::Queued`] a single drain task on the owner's pinned loop pops
//! one entry, awaits its transmission, runs the completion, then pops the next.
//! Queue order is channel order, and the task never starts a write before the
//! previous completion has returned.
//!
//! A failed write does not stop the queue: the completion gets the error and
//! the next entry is transmitted anyway. Deciding to close the peer is the
//! owner's job.
//!
//! The queueing algorithm is shared between stream and datagram transports.
//! [`Transmit::Addr`] is `()` for streams and the destination address for
//! datagrams, so each datagram entry carries its own destination.

use std::{
    future::Future,
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use tokio::{
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use crate::{buffer::Buffer, config::SendMode, error::SendError};

/// Callback run once with the outcome of a transmission (bytes written or the
/// I/O error).
pub type Completion = Box<dyn FnOnce(io::Result<usize>) + Send + 'static>;

/// Capability tag of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Connected byte stream. Entries carry no address.
    Stream,
    /// Connectionless datagrams. Every entry carries its destination.
    Datagram,
}

/// Write side of a transport, as seen by a [`SendPipeline`].
pub trait Transmit: Send + 'static {
    /// Per-entry destination: `()` for streams, a peer address for datagrams.
    type Addr: Send + Sync + 'static;

    /// Capability tag.
    const KIND: TransportKind;

    /// Transmit all of `data` to `dest`.
    fn transmit(
        &mut self,
        data: &[u8],
        dest: &Self::Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Transmit all of `data` synchronously on the calling thread, blocking
    /// until it is written. Used by [`SendMode::Inline`], possibly from the
    /// owner's own loop thread.
    fn try_transmit(&mut self, data: &[u8], dest: &Self::Addr) -> io::Result<usize>;

    /// Gracefully close the write side once the queue has drained.
    fn finish(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

struct SendOp<A> {
    data: Buffer,
    dest: A,
    on_complete: Option<Completion>,
}

impl<A> SendOp<A> {
    fn complete(self, result: io::Result<usize>) {
        if let Some(on_complete) = self.on_complete {
            on_complete(result);
        }
    }
}

enum Command<A> {
    Send(SendOp<A>),
    Close,
}

enum Dispatch<T: Transmit> {
    Queued(UnboundedSender<Command<T::Addr>>),
    Inline(Mutex<Option<T>>),
}

/// FIFO of pending transmissions with at most one in flight.
pub struct SendPipeline<T: Transmit> {
    dispatch: Dispatch<T>,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
    limit: Option<usize>,
}

impl<T: Transmit> SendPipeline<T> {
    /// Create an empty, idle pipeline around `transport`.
    ///
    /// In queued mode the drain task is spawned on `handle` (the owner's pinned
    /// loop) and its join handle is returned; it finishes once the pipeline is
    /// closed and drained. Inline mode has no task.
    pub fn new(
        handle: &Handle,
        transport: T,
        mode: SendMode,
        limit: Option<usize>,
    ) -> (Self, Option<JoinHandle<()>>) {
        let pending = Arc::new(AtomicUsize::new(0));
        let (dispatch, task) = match mode {
            SendMode::Queued => {
                let (tx, rx) = mpsc::unbounded_channel();
                let task = handle.spawn(drain(transport, rx, Arc::clone(&pending)));
                (Dispatch::Queued(tx), Some(task))
            },
            SendMode::Inline => (Dispatch::Inline(Mutex::new(Some(transport))), None),
        };

        (Self { dispatch, pending, closed: AtomicBool::new(false), limit }, task)
    }

    /// Append `data` to the queue, addressed to `dest`.
    ///
    /// Returns immediately in queued mode; `on_complete` runs later on the
    /// pinned loop. In inline mode the write and the completion both happen
    /// before this returns. On `Err` nothing was queued and `on_complete` is
    /// dropped without being called.
    pub fn enqueue(
        &self,
        data: Buffer,
        dest: T::Addr,
        on_complete: Option<Completion>,
    ) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        self.reserve()?;

        let op = SendOp { data, dest, on_complete };
        match &self.dispatch {
            Dispatch::Queued(tx) => {
                if tx.send(Command::Send(op)).is_err() {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    return Err(SendError::Closed);
                }
                Ok(())
            },
            Dispatch::Inline(transport) => {
                let mut guard = transport.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(transport) = guard.as_mut() else {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    return Err(SendError::Closed);
                };
                let result = transport.try_transmit(&op.data, &op.dest);
                // The completion may re-enter the pipeline (close on error).
                drop(guard);

                op.complete(result);
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Ok(())
            },
        }
    }

    fn reserve(&self) -> Result<(), SendError> {
        let limit = self.limit;
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match limit {
                Some(limit) if n >= limit => None,
                _ => Some(n + 1),
            })
            .map(|_| ())
            .map_err(|_| SendError::QueueFull { limit: limit.unwrap_or(0) })
    }

    /// Stop accepting entries. Entries already queued are still transmitted,
    /// then the transport is finished. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.dispatch {
            Dispatch::Queued(tx) => {
                // The drain task may already be gone with its loop.
                let _ = tx.send(Command::Close);
            },
            Dispatch::Inline(transport) => {
                drop(transport.lock().unwrap_or_else(PoisonError::into_inner).take());
            },
        }
    }

    /// Entries queued or in flight whose completion has not run yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Capability tag of the underlying transport.
    pub fn kind(&self) -> TransportKind {
        T::KIND
    }
}

impl<T: Transmit> std::fmt::Debug for SendPipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPipeline")
            .field("kind", &T::KIND)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn drain<T: Transmit>(
    mut transport: T,
    mut rx: UnboundedReceiver<Command<T::Addr>>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Send(op) => {
                let result = transport.transmit(&op.data, &op.dest).await;
                op.complete(result);
                pending.fetch_sub(1, Ordering::AcqRel);
            },
            Command::Close => break,
        }
    }

    // Entries that raced with close were accepted; fail them rather than
    // dropping their completions.
    rx.close();
    while let Ok(command) = rx.try_recv() {
        if let Command::Send(op) = command {
            op.complete(Err(io::ErrorKind::NotConnected.into()));
            pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    transport.finish().await;
}
