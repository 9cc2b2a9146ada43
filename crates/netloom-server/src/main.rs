//! Netloom echo server.
//!
//! Sends every received chunk back to the peer it came from.
//!
//! # Usage
//!
//! ```bash
//! # TCP echo on port 7000 with the default pool size
//! netloom-echo --bind 0.0.0.0:7000
//!
//! # Four loops, least-loaded assignment, plus a UDP echo socket
//! netloom-echo --bind 0.0.0.0:7000 --pool-size 4 --least-loaded --udp 0.0.0.0:7001
//! ```

use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use netloom_server::{
    Buffer, DatagramConfig, DatagramHandler, DatagramSocket, LoopSelection, PoolSize, SendMode,
    Server, ServerConfig, ServerError, Session, SessionHandler,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Netloom echo server
#[derive(Parser, Debug)]
#[command(name = "netloom-echo")]
#[command(about = "Echo server built on the netloom engine")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:7000")]
    bind: String,

    /// Number of event loops (0, missing or invalid means hardware threads x 2)
    #[arg(long)]
    pool_size: Option<String>,

    /// Assign sessions to the least-loaded loop instead of round robin
    #[arg(long)]
    least_loaded: bool,

    /// Write inline on the calling thread instead of queueing
    #[arg(long)]
    inline_send: bool,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Also echo UDP datagrams on this address
    #[arg(long)]
    udp: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

struct Echo;

impl SessionHandler for Echo {
    fn on_accept(&self, session: &Arc<Session>) {
        tracing::info!(
            session = %session.id(),
            addr = %session.peer_addr(),
            loop_index = session.loop_index(),
            "client connected"
        );
    }

    fn on_recv(&self, session: &Arc<Session>, data: Buffer) {
        if let Err(e) = session.send(data) {
            tracing::debug!(session = %session.id(), "echo dropped: {}", e);
        }
    }

    fn on_close(&self, session: &Arc<Session>) {
        tracing::info!(session = %session.id(), "client disconnected");
    }

    fn on_error(&self, error: &ServerError) {
        tracing::warn!("server error: {}", error);
    }
}

impl DatagramHandler for Echo {
    fn on_recv(&self, socket: &Arc<DatagramSocket>, data: Buffer, from: SocketAddr) {
        if let Err(e) = socket.send_to(data, from) {
            tracing::debug!(addr = %from, "datagram echo dropped: {}", e);
        }
    }

    fn on_error(&self, error: &ServerError) {
        tracing::warn!("datagram error: {}", error);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = ServerConfig {
        pool_size: PoolSize::from_param(args.pool_size.as_deref()),
        loop_selection: if args.least_loaded {
            LoopSelection::LeastLoaded
        } else {
            LoopSelection::RoundRobin
        },
        send_mode: if args.inline_send { SendMode::Inline } else { SendMode::Queued },
        max_sessions: args.max_sessions,
        ..ServerConfig::new(args.bind)
    };
    let send_mode = config.send_mode;

    let handler = Arc::new(Echo);
    let server = Arc::new(Server::new(config, Arc::clone(&handler) as Arc<dyn SessionHandler>));
    server.start()?;

    tracing::info!(
        "Echo server listening on {}:{}",
        server.listen_address(),
        server.listen_port()
    );

    let datagram = match args.udp {
        Some(bind_address) => {
            let config = DatagramConfig { send_mode, ..DatagramConfig::new(bind_address) };
            let socket = DatagramSocket::bind(server.pool(), config, handler)?;
            tracing::info!("Echoing datagrams on {}", socket.local_addr());
            Some(socket)
        },
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    if let Some(socket) = datagram {
        socket.close();
    }
    // stop() blocks until the loops are joined.
    tokio::task::spawn_blocking(move || server.stop()).await??;

    Ok(())
}
