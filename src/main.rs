mod cache;
mod config;
mod group;
mod handler;
mod hosts;
mod matcher;
mod outbound;
mod probe;
mod proto;
mod ranges;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Network;
use crate::handler::Handler;

#[derive(Parser, Debug)]
#[command(author, version, about = "Splitting, anti-poisoning DNS resolver", long_about = None)]
struct Args {
    /// Config file path (JSON)
    #[arg(short = 'c', long = "config", default_value = "config/splitdns.json")]
    config: PathBuf,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker count (default: CPU cores)
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = config::load_config(&args.config).context("load initial config")?;
    let listen: SocketAddr = cfg.main.listen.parse().context("parse listen addr")?;
    let network = cfg.main.network;
    let snapshot = config::build_snapshot(&cfg).context("build snapshot")?;
    let handler = Arc::new(Handler::new(snapshot).context("invalid handler config")?);

    handler.spawn_pollers().await;
    {
        // one-shot DoH bootstrap, off the startup path so a slow system
        // resolver cannot delay the listeners
        let handler = Arc::clone(&handler);
        tokio::spawn(async move { handler.resolve_doh().await });
    }
    watcher::spawn(args.config.clone(), Arc::clone(&handler));

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(listen = %listen, network = ?network, udp_workers, "dns server started");

    let mut tasks = Vec::new();

    if matches!(network, Network::Udp | Network::All) {
        #[cfg(unix)]
        {
            // individual sockets with SO_REUSEPORT so the kernel spreads
            // packets across workers
            for worker_id in 0..udp_workers {
                let handler = Arc::clone(&handler);
                let std_socket = create_reuseport_udp_socket(listen)
                    .with_context(|| format!("create udp socket for worker {worker_id}"))?;
                let socket = UdpSocket::from_std(std_socket)?;
                tasks.push(tokio::spawn(async move {
                    if let Err(err) = run_udp_worker(worker_id, Arc::new(socket), handler).await {
                        error!(worker_id, error = %err, "udp worker exited");
                    }
                }));
            }
        }

        #[cfg(not(unix))]
        {
            use socket2::{Domain, Protocol, Socket, Type};
            let domain = if listen.is_ipv4() {
                Domain::IPV4
            } else {
                Domain::IPV6
            };
            let socket =
                Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
            let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
            let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
            socket.set_nonblocking(true).context("set nonblocking")?;
            socket.bind(&listen.into()).context("bind socket")?;

            let udp_socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
            for worker_id in 0..udp_workers {
                let handler = Arc::clone(&handler);
                let socket = Arc::clone(&udp_socket);
                tasks.push(tokio::spawn(async move {
                    if let Err(err) = run_udp_worker(worker_id, socket, handler).await {
                        error!(worker_id, error = %err, "udp worker exited");
                    }
                }));
            }
        }
    }

    if matches!(network, Network::Tcp | Network::All) {
        let listener = TcpListener::bind(listen)
            .await
            .context("bind tcp listener")?;
        let handler = Arc::clone(&handler);
        tasks.push(tokio::spawn(async move {
            if let Err(err) = run_tcp(listener, handler).await {
                error!(error = %err, "tcp server exited");
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[allow(unused_imports)]
    use libc::{c_int, c_void, setsockopt, socklen_t, SOL_SOCKET, SO_REUSEPORT};
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // non-fatal: continue without reuseport
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn run_udp_worker(
    _worker_id: usize,
    socket: Arc<UdpSocket>,
    handler: Arc<Handler>,
) -> anyhow::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = buf[..len].to_vec();
                let handler = Arc::clone(&handler);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    match handler.handle_packet(&packet, peer).await {
                        Ok(reply) => {
                            let _ = socket.send_to(&reply, peer).await;
                        }
                        Err(err) => debug!(client = %peer, error = %err, "drop malformed query"),
                    }
                });
            }
            Err(err) => {
                debug!(error = %err, "udp recv error");
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, handler: Arc<Handler>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let _ = handle_tcp_conn(stream, peer, handler).await;
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
) -> anyhow::Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        if stream.read_exact(&mut buf).await.is_err() {
            return Ok(());
        }

        let reply = match handler.handle_packet(&buf, peer).await {
            Ok(reply) => reply,
            Err(_) => return Ok(()),
        };

        if reply.len() <= u16::MAX as usize {
            let len_bytes = (reply.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&reply).await.is_err() {
                return Ok(());
            }
        }
    }
}
