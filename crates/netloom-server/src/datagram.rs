//! Connectionless sockets.
//!
//! A [`DatagramSocket`] is a bound UDP socket pinned to one loop. Every send
//! names its destination, and every received datagram is delivered with its
//! source. Sends share one ordered pipeline, so datagrams leave in the order
//! they were queued whatever their destinations.
//!
//! A socket may also be connected to one peer. It then only receives that
//! peer's datagrams, [`DatagramSocket::send`] targets it, and ICMP errors for
//! it surface as receive errors.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
use socket2::{SockAddr, SockRef};
use tokio::{net::UdpSocket, sync::Notify, task::JoinHandle};

use crate::{
    buffer::{Buffer, take_filled},
    config::DatagramConfig,
    error::{SendError, ServerError},
    handler::DatagramHandler,
    pipeline::{Completion, SendPipeline},
    pool::{EventLoopPool, LoopHandle},
    transport::{DatagramTx, bind_datagram, resolve_address},
};

/// Pause after a failed receive before the next one is armed.
const RECV_BACKOFF: Duration = Duration::from_millis(50);

/// A bound datagram socket.
pub struct DatagramSocket {
    local_addr: SocketAddr,
    peer: RwLock<Option<SocketAddr>>,
    socket: Arc<UdpSocket>,
    pin: LoopHandle,
    open: AtomicBool,
    close_requested: Notify,
    pipeline: SendPipeline<DatagramTx>,
    handler: Arc<dyn DatagramHandler>,
}

impl DatagramSocket {
    /// Bind `config.bind_address` on a loop chosen by the pool and start
    /// receiving.
    ///
    /// Fails with [`ServerError::Lifecycle`] if the pool is not running,
    /// [`ServerError::Config`] if the address does not resolve, and
    /// [`ServerError::Transport`] if bind fails.
    pub fn bind(
        pool: &EventLoopPool,
        config: DatagramConfig,
        handler: Arc<dyn DatagramHandler>,
    ) -> Result<Arc<Self>, ServerError> {
        let addr = resolve_address(&config.bind_address)?;
        let pin = pool
            .select()
            .ok_or_else(|| ServerError::Lifecycle("event loop pool is not running".into()))?;
        let handle = pin.handle().clone();

        let socket = {
            let _enter = handle.enter();
            Arc::new(bind_datagram(addr)?)
        };
        let local_addr = socket.local_addr()?;
        let (pipeline, drain) = SendPipeline::new(
            &handle,
            DatagramTx::new(Arc::clone(&socket)),
            config.send_mode,
            config.send_queue_limit,
        );

        let this = Arc::new(Self {
            local_addr,
            peer: RwLock::new(None),
            socket: Arc::clone(&socket),
            pin,
            open: AtomicBool::new(true),
            close_requested: Notify::new(),
            pipeline,
            handler,
        });

        let guard = CloseGuard(Arc::clone(&this));
        handle.spawn(Arc::clone(&this).run(guard, config.read_buffer_size, drain));

        tracing::info!(addr = %local_addr, loop_index = this.loop_index(), "datagram socket bound");
        Ok(this)
    }

    async fn run(
        self: Arc<Self>,
        _guard: CloseGuard,
        size: usize,
        drain: Option<JoinHandle<()>>,
    ) {
        let mut buf = BytesMut::with_capacity(size);

        while self.is_open() {
            tokio::select! {
                biased;
                () = self.close_requested.notified() => break,
                result = self.socket.recv_buf_from(&mut buf) => match result {
                    Ok((_, from)) => {
                        let data = take_filled(&mut buf, size);
                        self.handler.on_recv(&self, data, from);
                    },
                    Err(e) => {
                        tracing::debug!(addr = %self.local_addr, "receive failed: {}", e);
                        buf.clear();
                        self.handler.on_error(&ServerError::Transport(format!(
                            "receive on {} failed: {e}",
                            self.local_addr
                        )));
                        tokio::select! {
                            biased;
                            () = self.close_requested.notified() => break,
                            () = tokio::time::sleep(RECV_BACKOFF) => {},
                        }
                    },
                },
            }
        }

        self.open.store(false, Ordering::Release);
        self.pipeline.close();
        if let Some(drain) = drain {
            // Only fails if the loop is being torn down.
            let _ = drain.await;
        }
        tracing::debug!(addr = %self.local_addr, "datagram socket closed");
    }

    /// Connect the socket to `peer`. May be called again to switch peers.
    ///
    /// Fails with [`ServerError::Lifecycle`] once closed and
    /// [`ServerError::Transport`] if the kernel rejects the peer.
    pub fn connect(&self, peer: SocketAddr) -> Result<(), ServerError> {
        if !self.is_open() {
            return Err(ServerError::Lifecycle("datagram socket is closed".into()));
        }
        SockRef::from(&*self.socket).connect(&SockAddr::from(peer)).map_err(|e| {
            ServerError::Transport(format!("failed to connect {} to {peer}: {e}", self.local_addr))
        })?;

        *self.peer.write().unwrap_or_else(PoisonError::into_inner) = Some(peer);
        tracing::debug!(addr = %self.local_addr, peer = %peer, "datagram socket connected");
        Ok(())
    }

    /// Connected peer, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `data` for the connected peer. See [`DatagramSocket::send_with`].
    pub fn send(self: &Arc<Self>, data: Buffer) -> Result<(), SendError> {
        let peer = self.peer_addr().ok_or(SendError::NotConnected)?;
        self.enqueue(data, peer, None)
    }

    /// Queue `data` for the connected peer and run `on_complete` with the
    /// outcome. Ordered with every other send on this socket.
    pub fn send_with<F>(self: &Arc<Self>, data: Buffer, on_complete: F) -> Result<(), SendError>
    where
        F: FnOnce(io::Result<usize>) + Send + 'static,
    {
        let peer = self.peer_addr().ok_or(SendError::NotConnected)?;
        self.enqueue(data, peer, Some(Box::new(on_complete)))
    }

    /// Queue `data` for `dest`. See [`DatagramSocket::send_to_with`].
    pub fn send_to(self: &Arc<Self>, data: Buffer, dest: SocketAddr) -> Result<(), SendError> {
        self.enqueue(data, dest, None)
    }

    /// Queue `data` for `dest` and run `on_complete` with the outcome.
    ///
    /// Datagrams are sent in call order. A failed send is reported to the
    /// handler's `on_send` and to `on_complete`; it does not close the socket.
    pub fn send_to_with<F>(
        self: &Arc<Self>,
        data: Buffer,
        dest: SocketAddr,
        on_complete: F,
    ) -> Result<(), SendError>
    where
        F: FnOnce(io::Result<usize>) + Send + 'static,
    {
        self.enqueue(data, dest, Some(Box::new(on_complete)))
    }

    fn enqueue(
        self: &Arc<Self>,
        data: Buffer,
        dest: SocketAddr,
        on_complete: Option<Completion>,
    ) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }

        let socket = Arc::clone(self);
        let completion: Completion = Box::new(move |result: io::Result<usize>| {
            socket.handler.on_send(&socket, dest, &result);
            if let Err(e) = &result {
                tracing::debug!(dest = %dest, "datagram send failed: {}", e);
            }
            if let Some(on_complete) = on_complete {
                on_complete(result);
            }
        });
        self.pipeline.enqueue(data, dest, Some(completion))
    }

    /// Stop receiving and release the socket once queued sends are done.
    /// Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.close_requested.notify_one();
        }
    }

    /// Bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the socket is still receiving and accepting sends.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Index of the event loop this socket is pinned to.
    pub fn loop_index(&self) -> usize {
        self.pin.index()
    }

    /// Sends queued or in flight.
    pub fn pending_sends(&self) -> usize {
        self.pipeline.pending()
    }
}

impl fmt::Debug for DatagramSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramSocket")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr())
            .field("loop_index", &self.loop_index())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Marks the socket closed when the receive task ends or is torn down.
struct CloseGuard(Arc<DatagramSocket>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.open.store(false, Ordering::Release);
        self.0.pipeline.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::{LoopSelection, PoolSize},
        handler::NoopHandler,
    };

    #[test]
    fn bind_requires_running_pool() {
        let pool = EventLoopPool::new(PoolSize::Fixed(1), LoopSelection::RoundRobin);
        let result =
            DatagramSocket::bind(&pool, DatagramConfig::default(), Arc::new(NoopHandler));
        assert!(matches!(result, Err(ServerError::Lifecycle(_))));
    }

    #[test]
    fn close_rejects_further_sends() {
        let pool = EventLoopPool::new(PoolSize::Fixed(1), LoopSelection::RoundRobin);
        pool.run().unwrap();

        let socket =
            DatagramSocket::bind(&pool, DatagramConfig::default(), Arc::new(NoopHandler)).unwrap();
        assert!(socket.is_open());
        assert_ne!(socket.local_addr().port(), 0);

        socket.close();
        socket.close();
        assert!(!socket.is_open());
        let dest = socket.local_addr();
        assert_eq!(socket.send_to(Buffer::from_static(b"x"), dest), Err(SendError::Closed));

        pool.stop().unwrap();
    }

    #[test]
    fn send_requires_a_peer() {
        let pool = EventLoopPool::new(PoolSize::Fixed(1), LoopSelection::RoundRobin);
        pool.run().unwrap();
        let socket =
            DatagramSocket::bind(&pool, DatagramConfig::default(), Arc::new(NoopHandler)).unwrap();

        assert!(socket.peer_addr().is_none());
        assert_eq!(socket.send(Buffer::from_static(b"x")), Err(SendError::NotConnected));

        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        socket.connect(peer.local_addr().unwrap()).unwrap();
        assert_eq!(socket.peer_addr(), Some(peer.local_addr().unwrap()));
        socket.send(Buffer::from_static(b"hi")).unwrap();

        let mut buf = [0u8; 4];
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");

        socket.close();
        assert!(matches!(
            socket.connect(peer.local_addr().unwrap()),
            Err(ServerError::Lifecycle(_))
        ));
        pool.stop().unwrap();
    }

    #[test]
    fn echoes_to_source() {
        struct Echo;

        impl DatagramHandler for Echo {
            fn on_recv(&self, socket: &Arc<DatagramSocket>, data: Buffer, from: SocketAddr) {
                let _ = socket.send_to(data, from);
            }
        }

        let pool = EventLoopPool::new(PoolSize::Fixed(2), LoopSelection::RoundRobin);
        pool.run().unwrap();
        let socket =
            DatagramSocket::bind(&pool, DatagramConfig::default(), Arc::new(Echo)).unwrap();

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.send_to(b"ping", socket.local_addr()).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, socket.local_addr());

        socket.close();
        pool.stop().unwrap();
    }
}
