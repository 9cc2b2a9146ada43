//! End-to-end tests for the stream server.
//!
//! Real TCP clients (blocking `std::net`) talk to a server running on its own
//! event-loop pool.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use netloom_server::{
    Buffer, PoolSize, SendMode, Server, ServerConfig, ServerError, Session, SessionHandler,
    SessionId, SessionState,
};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `TIMEOUT` elapses.
fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn connect(server: &Server) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", server.listen_port())).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

/// Read until EOF or a reset. Returns the bytes seen before that.
fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return data,
            Ok(n) => data.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Records every callback.
#[derive(Default)]
struct Recorder {
    accepted: AtomicUsize,
    closed: AtomicUsize,
    received: Mutex<Vec<u8>>,
    closed_ids: Mutex<Vec<SessionId>>,
    echo: bool,
}

impl Recorder {
    fn echoing() -> Self {
        Self { echo: true, ..Self::default() }
    }

    fn events(&self) -> (usize, usize, usize) {
        (
            self.accepted.load(Ordering::SeqCst),
            self.closed.load(Ordering::SeqCst),
            self.received.lock().unwrap().len(),
        )
    }
}

impl SessionHandler for Recorder {
    fn on_accept(&self, _session: &Arc<Session>) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }

    fn on_recv(&self, session: &Arc<Session>, data: Buffer) {
        self.received.lock().unwrap().extend_from_slice(&data);
        if self.echo {
            let _ = session.send(data);
        }
    }

    fn on_close(&self, session: &Arc<Session>) {
        assert_eq!(session.state(), SessionState::Closed);
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.closed_ids.lock().unwrap().push(session.id());
    }
}

fn start(handler: &Arc<Recorder>, config: ServerConfig) -> Server {
    let server = Server::new(config, Arc::clone(handler) as Arc<dyn SessionHandler>);
    server.start().unwrap();
    server
}

fn two_loops() -> ServerConfig {
    ServerConfig { pool_size: PoolSize::Fixed(2), ..ServerConfig::default() }
}

#[test]
fn broadcast_reaches_every_session_and_disconnects_are_tracked() {
    let handler = Arc::new(Recorder::default());
    let server = start(&handler, two_loops());

    let mut clients: Vec<TcpStream> = (0..5).map(|_| connect(&server)).collect();
    assert!(wait_until(|| server.session_count() == 5));

    let loops: Vec<usize> = {
        let mut loops = Vec::new();
        server.for_each_session(|s| loops.push(s.loop_index()));
        loops
    };
    assert!(loops.contains(&0) && loops.contains(&1));

    assert_eq!(server.send(Buffer::from_static(b"hello")), Ok(5));
    for client in &mut clients {
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    for client in clients.drain(..2) {
        client.shutdown(Shutdown::Both).unwrap();
    }
    assert!(wait_until(|| server.session_count() == 3));
    assert!(wait_until(|| handler.closed.load(Ordering::SeqCst) == 2));

    for id in handler.closed_ids.lock().unwrap().iter() {
        assert!(server.session(*id).is_none());
    }

    server.stop().unwrap();
    assert_eq!(server.session_count(), 0);
    assert_eq!(handler.accepted.load(Ordering::SeqCst), 5);
    assert_eq!(handler.closed.load(Ordering::SeqCst), 5);
}

#[test]
fn echo_round_trip() {
    let handler = Arc::new(Recorder::echoing());
    let server = start(&handler, two_loops());

    let mut client = connect(&server);
    client.write_all(b"ping").unwrap();

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");

    server.stop().unwrap();
}

#[test]
fn session_sends_arrive_in_order() {
    let handler = Arc::new(Recorder::default());
    let server = start(&handler, two_loops());

    let mut client = connect(&server);
    assert!(wait_until(|| server.session_count() == 1));
    let session = server.find_session_if(|_| true).unwrap();

    let expected: Vec<u8> = (0..200u32).flat_map(|i| i.to_be_bytes()).collect();
    for i in 0..200u32 {
        session.send(Buffer::copy_from_slice(&i.to_be_bytes())).unwrap();
    }

    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, expected);

    server.stop().unwrap();
}

#[test]
fn inline_mode_sends_before_returning() {
    let handler = Arc::new(Recorder::default());
    let config = ServerConfig { send_mode: SendMode::Inline, ..two_loops() };
    let server = start(&handler, config);

    let mut client = connect(&server);
    assert!(wait_until(|| server.session_count() == 1));
    let session = server.find_session_if(|_| true).unwrap();

    let (tx, rx) = mpsc::channel();
    session
        .send_with(Buffer::from_static(b"inline"), move |result| {
            let _ = tx.send(result.map_err(|e| e.kind()));
        })
        .unwrap();
    assert_eq!(rx.try_recv().unwrap(), Ok(6));

    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"inline");

    server.stop().unwrap();
}

#[test]
fn inline_send_from_on_accept_reaches_every_client() {
    #[derive(Default)]
    struct Greeter {
        results: Mutex<Vec<Option<Result<usize, io::ErrorKind>>>>,
    }

    impl SessionHandler for Greeter {
        fn on_accept(&self, session: &Arc<Session>) {
            let (tx, rx) = mpsc::channel();
            let result = session
                .send_with(Buffer::from_static(b"hello"), move |result| {
                    let _ = tx.send(result.map_err(|e| e.kind()));
                })
                .ok()
                .and_then(|()| rx.try_recv().ok());
            self.results.lock().unwrap().push(result);
        }
    }

    let handler = Arc::new(Greeter::default());
    let config = ServerConfig { send_mode: SendMode::Inline, ..two_loops() };
    let server = Server::new(config, Arc::clone(&handler) as Arc<dyn SessionHandler>);
    server.start().unwrap();

    let mut clients: Vec<TcpStream> = (0..10).map(|_| connect(&server)).collect();
    for client in &mut clients {
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    assert!(wait_until(|| handler.results.lock().unwrap().len() == 10));
    assert!(handler.results.lock().unwrap().iter().all(|r| *r == Some(Ok(5))));

    server.stop().unwrap();
}

#[test]
fn inline_send_larger_than_the_socket_buffer_completes() {
    const LEN: usize = 16 * 1024 * 1024;

    let handler = Arc::new(Recorder::default());
    let config = ServerConfig { send_mode: SendMode::Inline, ..two_loops() };
    let server = start(&handler, config);

    let mut client = connect(&server);
    assert!(wait_until(|| server.session_count() == 1));
    let session = server.find_session_if(|_| true).unwrap();

    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let reader = thread::spawn(move || {
        let mut received = vec![0u8; LEN];
        client.read_exact(&mut received).unwrap();
        received
    });

    let (tx, rx) = mpsc::channel();
    session
        .send_with(Buffer::from(payload), move |result| {
            let _ = tx.send(result.map_err(|e| e.kind()));
        })
        .unwrap();
    assert_eq!(rx.try_recv().unwrap(), Ok(LEN));

    assert!(reader.join().unwrap() == expected);
    assert!(wait_until(|| session.is_connected()));
    assert_eq!(handler.closed.load(Ordering::SeqCst), 0);

    server.stop().unwrap();
}

#[test]
fn write_error_closes_the_session() {
    #[derive(Default)]
    struct Failures {
        send_errors: AtomicUsize,
        closed: AtomicUsize,
    }

    impl SessionHandler for Failures {
        fn on_send(&self, _session: &Arc<Session>, result: &io::Result<usize>) {
            if result.is_err() {
                self.send_errors.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_close(&self, _session: &Arc<Session>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    let handler = Arc::new(Failures::default());
    let server = Server::new(two_loops(), Arc::clone(&handler) as Arc<dyn SessionHandler>);
    server.start().unwrap();

    let client = connect(&server);
    assert!(wait_until(|| server.session_count() == 1));
    let session = server.find_session_if(|_| true).unwrap();

    // Far more than the socket buffers hold; the client never reads, so the
    // write is still in flight when the connection is reset.
    let (tx, rx) = mpsc::channel();
    session
        .send_with(Buffer::from(vec![0u8; 64 * 1024 * 1024]), move |result| {
            let _ = tx.send(result.map_err(|e| e.kind()));
        })
        .unwrap();
    thread::sleep(Duration::from_millis(50));

    socket2::SockRef::from(&client).set_linger(Some(Duration::ZERO)).unwrap();
    drop(client);

    assert!(rx.recv_timeout(TIMEOUT).unwrap().is_err());
    assert!(wait_until(|| server.session_count() == 0));
    assert!(wait_until(|| handler.closed.load(Ordering::SeqCst) == 1));
    assert!(handler.send_errors.load(Ordering::SeqCst) >= 1);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.send(Buffer::from_static(b"late")).is_err());

    server.stop().unwrap();
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn local_close_ends_the_connection() {
    let handler = Arc::new(Recorder::default());
    let server = start(&handler, two_loops());

    let mut client = connect(&server);
    let client_addr = client.local_addr().unwrap();
    assert!(wait_until(|| server.session_count() == 1));

    let session = server.find_session_if(|s| s.peer_addr() == client_addr).unwrap();
    session.send(Buffer::from_static(b"bye")).unwrap();
    session.close();
    session.close();
    assert!(session.send(Buffer::from_static(b"late")).is_err());

    // Queued data is flushed before the stream is shut down.
    assert_eq!(read_until_closed(&mut client), b"bye");
    assert!(wait_until(|| server.session_count() == 0));
    assert!(wait_until(|| handler.closed.load(Ordering::SeqCst) == 1));
    assert_eq!(session.state(), SessionState::Closed);

    server.stop().unwrap();
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn session_limit_drops_extra_connections() {
    let handler = Arc::new(Recorder::default());
    let config = ServerConfig { max_sessions: Some(1), ..two_loops() };
    let server = start(&handler, config);

    let _first = connect(&server);
    assert!(wait_until(|| server.session_count() == 1));

    let mut second = connect(&server);
    assert!(read_until_closed(&mut second).is_empty());
    assert_eq!(server.session_count(), 1);

    server.stop().unwrap();
}

#[test]
fn double_start_is_rejected() {
    let handler = Arc::new(Recorder::default());
    let server = start(&handler, two_loops());
    let port = server.listen_port();

    assert!(matches!(server.start(), Err(ServerError::Lifecycle(_))));
    assert!(matches!(server.last_error(), Some(ServerError::Lifecycle(_))));
    assert_eq!(server.listen_port(), port);

    // Still serving.
    let _client = connect(&server);
    assert!(wait_until(|| server.session_count() == 1));

    server.stop().unwrap();
}

#[test]
fn stop_on_never_started_server_is_noop() {
    let handler = Arc::new(Recorder::default());
    let server = Server::new(two_loops(), Arc::clone(&handler) as Arc<dyn SessionHandler>);

    server.stop().unwrap();
    assert!(server.is_stopped());
    assert!(server.last_error().is_none());
    assert_eq!(handler.events(), (0, 0, 0));
}

#[test]
fn nothing_is_observed_after_stop() {
    let handler = Arc::new(Recorder::default());
    let server = start(&handler, two_loops());
    let port = server.listen_port();

    let mut client = connect(&server);
    client.write_all(b"before").unwrap();
    assert!(wait_until(|| handler.received.lock().unwrap().len() == 6));

    server.stop().unwrap();
    assert!(server.is_stopped());
    assert_eq!(server.listen_port(), 0);
    assert_eq!(server.send(Buffer::from_static(b"x")), Err(netloom_server::SendError::Stopped));

    // Every session was finalised during stop().
    let events = handler.events();
    assert_eq!(events, (1, 1, 6));

    // The connection is gone and nothing new is accepted.
    let _ = client.write_all(b"after");
    assert!(read_until_closed(&mut client).is_empty());
    assert!(TcpStream::connect(("127.0.0.1", port)).is_err());

    thread::sleep(Duration::from_millis(100));
    assert_eq!(handler.events(), events);
}

#[test]
fn stop_is_refused_from_a_loop_thread() {
    struct StopFromCallback {
        server: Mutex<Option<Arc<Server>>>,
        result: Mutex<Option<Result<(), ServerError>>>,
    }

    impl SessionHandler for StopFromCallback {
        fn on_accept(&self, _session: &Arc<Session>) {
            if let Some(server) = self.server.lock().unwrap().as_ref() {
                *self.result.lock().unwrap() = Some(server.stop());
            }
        }
    }

    let handler =
        Arc::new(StopFromCallback { server: Mutex::new(None), result: Mutex::new(None) });
    let server = Arc::new(Server::new(
        two_loops(),
        Arc::clone(&handler) as Arc<dyn SessionHandler>,
    ));
    server.start().unwrap();
    *handler.server.lock().unwrap() = Some(Arc::clone(&server));

    let _client = connect(&server);
    assert!(wait_until(|| handler.result.lock().unwrap().is_some()));

    let result = handler.result.lock().unwrap().take().unwrap();
    assert!(matches!(result, Err(ServerError::Lifecycle(_))));
    assert!(server.is_started());

    handler.server.lock().unwrap().take();
    server.stop().unwrap();
}
