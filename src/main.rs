use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use adoptd::config::{DEFAULT_FD_LIMIT_PER_THREAD, DEFAULT_THREADS};
use adoptd::{
    AdoptionError, Connection, Context, Descriptor, DescriptorKind, Disposition, Protocol, Reason,
    ServiceConfig, VirtualHost, metrics,
};

#[derive(Parser)]
#[command(about = "Adopts accepted sockets onto polled service threads and echoes what they send")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = 9900)]
    port: u16,

    /// Service threads
    #[arg(short, long, default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Poll table slots per service thread
    #[arg(long, default_value_t = DEFAULT_FD_LIMIT_PER_THREAD)]
    fd_limit: usize,

    /// Maximum simultaneous connections from one peer address
    #[arg(long)]
    peer_limit: Option<u32>,

    /// Also bind a UDP endpoint on this port and log datagrams it receives
    #[arg(long)]
    udp_port: Option<u16>,

    /// Local address for the UDP endpoint (default: any IPv4, then any IPv6)
    #[arg(long, requires = "udp_port")]
    udp_host: Option<String>,

    /// Adopt accepted sockets as raw byte streams instead of HTTP
    #[arg(long)]
    raw: bool,
}

/// Backoff when every service thread is full.
const NO_CAPACITY_BACKOFF: Duration = Duration::from_millis(10);

fn echo(conn: &mut Connection, reason: Reason, payload: &[u8]) -> Disposition {
    match reason {
        Reason::Receive | Reason::RawRx => match conn.write(payload) {
            Ok(n) if n < payload.len() => {
                debug!(conn = %conn.id(), sent = n, len = payload.len(), "short echo");
                Disposition::Continue
            }
            Ok(_) => Disposition::Continue,
            Err(e) => {
                debug!(conn = %conn.id(), error = %e, "echo failed");
                Disposition::Close
            }
        },
        Reason::NewClientInstantiated | Reason::RawAdopt => {
            trace!(conn = %conn.id(), peer = ?conn.peer_addr(), "client adopted");
            Disposition::Continue
        }
        Reason::ConnectionDestroyed => {
            trace!(conn = %conn.id(), "client gone");
            Disposition::Continue
        }
        _ => Disposition::Continue,
    }
}

fn datagram_log(conn: &mut Connection, reason: Reason, payload: &[u8]) -> Disposition {
    if reason == Reason::RawRx {
        info!(conn = %conn.id(), len = payload.len(), "datagram");
    }
    Disposition::Continue
}

fn create_listener(port: u16) -> Socket {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(SockProtocol::TCP))
        .expect("failed to create socket");
    socket.set_reuse_address(true).expect("SO_REUSEADDR");
    socket.set_reuse_port(true).expect("SO_REUSEPORT");
    socket.set_nodelay(true).expect("TCP_NODELAY");

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into()).expect("failed to bind");
    socket.listen(1024).expect("failed to listen");
    socket
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adoptd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    metrics::spawn_reporter();

    let args = Args::parse();
    let config = ServiceConfig::with_threads(args.threads, args.fd_limit);

    let mut vhost = VirtualHost::builder("default")
        .protocol(Protocol::new("echo", echo))
        .protocol(Protocol::new("datagram-log", datagram_log));
    if let Some(limit) = args.peer_limit {
        vhost = vhost.peer_limit(limit);
    }
    let vhost = vhost.build().expect("invalid vhost");

    let (ctx, workers) = Context::builder(config)
        .vhost(Arc::clone(&vhost))
        .build()
        .expect("failed to build service context");

    let shutdown = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = workers
        .into_iter()
        .map(|w| {
            w.spawn(Arc::clone(&shutdown))
                .expect("failed to spawn service thread")
        })
        .collect();

    if let Some(port) = args.udp_port {
        let host = args.udp_host.as_deref();
        match ctx.bootstrap_udp_on(&vhost, host, port, true, Some("datagram-log"), None) {
            Ok(Some(handle)) => info!(conn = %handle.id, port, "udp endpoint up"),
            Ok(None) => warn!(port, "udp endpoint closed during adoption"),
            Err(e) => error!(port, error = %e, "udp endpoint failed"),
        }
    }

    let kind = if args.raw {
        DescriptorKind::RawSocket
    } else {
        DescriptorKind::Http
    };
    let listener = create_listener(args.port);
    info!(
        port = args.port,
        threads = args.threads,
        fd_limit = args.fd_limit,
        ?kind,
        "adoptd: ready"
    );

    loop {
        let socket = match listener.accept() {
            Ok((socket, _)) => socket,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        };
        match ctx.adopt(&vhost, Descriptor::Socket(socket), kind, None, None) {
            Ok(_) => {}
            Err(AdoptionError::PeerLimitExceeded { .. }) => {}
            Err(AdoptionError::NoCapacity) => std::thread::sleep(NO_CAPACITY_BACKOFF),
            Err(e) => warn!(error = %e, "adoption failed"),
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.join();
    }
}
