//! Tokio socket transports.
//!
//! Binding helpers for the listening and datagram sockets, and the two
//! [`Transmit`] implementations used by sessions and datagram sockets:
//!
//! - [`StreamTx`]: write half of an accepted TCP stream (`Addr = ()`)
//! - [`DatagramTx`]: shared UDP socket (`Addr = SocketAddr`)
//!
//! TLS or any other stream decoration would sit below this layer.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
};

use socket2::{SockAddr, SockRef, Socket};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpSocket, TcpStream, UdpSocket, tcp::OwnedWriteHalf},
};

use crate::{
    error::ServerError,
    pipeline::{Transmit, TransportKind},
};

/// Resolve `address` ("host:port") to the first socket address it names.
pub fn resolve_address(address: &str) -> Result<SocketAddr, ServerError> {
    address
        .to_socket_addrs()
        .map_err(|e| ServerError::Config(format!("invalid address '{address}': {e}")))?
        .next()
        .ok_or_else(|| ServerError::Config(format!("address '{address}' resolved to nothing")))
}

/// Bind and listen on `addr`.
///
/// Must run inside a runtime context (the listener registers with the
/// calling loop's reactor).
pub fn bind_listener(
    addr: SocketAddr,
    backlog: u32,
    reuse_address: bool,
) -> Result<TcpListener, ServerError> {
    let socket = (if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() })
        .map_err(|e| ServerError::Resource(format!("failed to create socket: {e}")))?;

    socket
        .set_reuseaddr(reuse_address)
        .map_err(|e| ServerError::Transport(format!("failed to set SO_REUSEADDR: {e}")))?;
    socket
        .bind(addr)
        .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;
    socket
        .listen(backlog)
        .map_err(|e| ServerError::Transport(format!("failed to listen on {addr}: {e}")))
}

/// Bind a UDP socket on `addr`.
///
/// Must run inside a runtime context.
pub fn bind_datagram(addr: SocketAddr) -> Result<UdpSocket, ServerError> {
    let socket = std::net::UdpSocket::bind(addr)
        .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::Transport(format!("failed to set non-blocking: {e}")))?;
    UdpSocket::from_std(socket)
        .map_err(|e| ServerError::Transport(format!("failed to register {addr}: {e}")))
}

/// Write half of a connected TCP stream.
#[derive(Debug)]
pub struct StreamTx(OwnedWriteHalf);

impl StreamTx {
    /// Wrap the write half of a split stream.
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self(half)
    }
}

impl Transmit for StreamTx {
    type Addr = ();

    const KIND: TransportKind = TransportKind::Stream;

    async fn transmit(&mut self, data: &[u8], _: &()) -> io::Result<usize> {
        self.0.write_all(data).await?;
        Ok(data.len())
    }

    fn try_transmit(&mut self, data: &[u8], _: &()) -> io::Result<usize> {
        let stream: &TcpStream = self.0.as_ref();
        let socket = SockRef::from(stream);
        let mut written = 0;
        while written < data.len() {
            match send_now(&socket, |s| s.send(&data[written..]))? {
                0 => return Err(io::ErrorKind::WriteZero.into()),
                n => written += n,
            }
        }
        Ok(written)
    }

    async fn finish(&mut self) {
        if let Err(e) = self.0.shutdown().await {
            tracing::debug!("stream shutdown failed: {}", e);
        }
    }
}

/// Shared UDP socket used as a datagram transmitter.
#[derive(Debug, Clone)]
pub struct DatagramTx(Arc<UdpSocket>);

impl DatagramTx {
    /// Transmitter sharing `socket` with its receive loop.
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self(socket)
    }
}

impl Transmit for DatagramTx {
    type Addr = SocketAddr;

    const KIND: TransportKind = TransportKind::Datagram;

    async fn transmit(&mut self, data: &[u8], dest: &SocketAddr) -> io::Result<usize> {
        self.0.send_to(data, *dest).await
    }

    fn try_transmit(&mut self, data: &[u8], dest: &SocketAddr) -> io::Result<usize> {
        let socket = SockRef::from(&*self.0);
        let dest = SockAddr::from(*dest);
        send_now(&socket, |s| s.send_to(data, &dest))
    }
}

/// Run one send syscall on `socket`, blocking until it can make progress.
///
/// Goes to the socket directly: the owning loop's readiness cache is not
/// consulted, so this works before the loop has polled the socket and from
/// the loop's own thread.
fn send_now(
    socket: &Socket,
    mut send: impl FnMut(&Socket) -> io::Result<usize>,
) -> io::Result<usize> {
    loop {
        match send(socket) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait_writable(socket)?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            result => return result,
        }
    }
}

#[cfg(unix)]
fn wait_writable(socket: &Socket) -> io::Result<()> {
    use std::os::fd::AsFd;

    use nix::{
        errno::Errno,
        poll::{PollFd, PollFlags, PollTimeout, poll},
    };

    // POLLERR and POLLHUP also end the wait; the next send reports them.
    let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLOUT)];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Err(Errno::EINTR) => {},
            result => return result.map(|_| ()).map_err(io::Error::from),
        }
    }
}

#[cfg(not(unix))]
fn wait_writable(_socket: &Socket) -> io::Result<()> {
    std::thread::sleep(std::time::Duration::from_millis(1));
    Ok(())
}
