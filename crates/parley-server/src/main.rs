use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod clock;
mod config;
mod dispatch;
mod session;
mod state;
mod stats;
mod storage;
mod udp;

use config::ServerConfig;
use dispatch::ServerCtx;
use state::Registry;
use stats::Telemetry;
use storage::{MemoryStore, StorageBridge};

/// The relay is I/O-bound; past this many workers the added context
/// switching and room-lock contention outweigh any throughput gain.
const MAX_WORKER_THREADS: usize = 16;

#[derive(Parser)]
#[command(name = "parley-server", about = "Parley group voice and chat relay server")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// TCP control port, overrides config
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP voice port, overrides config
    #[arg(long)]
    udp_port: Option<u16>,

    /// Attachments directory, overrides config
    #[arg(long)]
    attachments_dir: Option<String>,

    /// Voice telemetry snapshot path, overrides config
    #[arg(long)]
    stats_path: Option<String>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {config_path}"))?;
        toml::from_str(&content)?
    } else {
        ServerConfig::default()
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.tcp_port {
        config.tcp_port = port;
    }
    if let Some(port) = args.udp_port {
        config.udp_port = port;
    }
    if let Some(dir) = args.attachments_dir {
        config.attachments_dir = dir;
    }
    if let Some(path) = args.stats_path {
        config.stats_path = path;
    }

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(MAX_WORKER_THREADS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    info!(workers, "Parley server starting");
    runtime.block_on(run(config))
}

fn init_tracing() {
    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley_server=info"));
    // VOICE_TRACE=1 turns on the per-event voice trace stream.
    let voice_trace = std::env::var("VOICE_TRACE").is_ok_and(|v| v == "1");
    let directive = if voice_trace {
        "voice_trace=trace"
    } else {
        "voice_trace=off"
    };
    filter = filter.add_directive(directive.parse().expect("static directive parses"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: ServerConfig) -> Result<()> {
    let registry = Arc::new(Registry::new());
    let stats = Arc::new(Telemetry::new(&config.stats_path));
    let storage = StorageBridge::spawn(MemoryStore::new());

    let tcp_listener = TcpListener::bind(format!("{}:{}", config.host, config.tcp_port))
        .await
        .with_context(|| format!("failed to bind TCP on {}:{}", config.host, config.tcp_port))?;
    info!("TCP listener bound on {}:{}", config.host, config.tcp_port);

    let udp_socket = bind_udp_socket(&config)?;
    info!("UDP socket bound on {}:{}", config.host, config.udp_port);

    let ctx = Arc::new(ServerCtx {
        registry: registry.clone(),
        storage,
        stats: stats.clone(),
        config,
    });

    tokio::spawn(udp::run_udp_loop(udp_socket, registry.clone()));
    tokio::spawn(run_liveness_sweep(registry.clone()));
    tokio::spawn(run_channel_gc(registry.clone()));
    tokio::spawn(stats::run_writer(stats));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(run_signal_handler(registry.clone(), shutdown_tx));

    info!("server ready, accepting connections");
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = tcp_listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(result) => result,
                    Err(e) => {
                        error!("TCP accept error: {e}");
                        continue;
                    }
                };
                if ctx.registry.session_count().await >= ctx.config.max_users {
                    warn!(peer = %peer, "refusing connection: server is full");
                    continue;
                }
                let ctx = ctx.clone();
                tokio::spawn(dispatch::run_connection(stream, ctx));
            }
        }
    }

    // Drain: sessions were asked to close; give their handlers a moment.
    for _ in 0..50 {
        if registry.session_count().await == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Bind the voice socket through socket2 so the buffers are large enough to
/// absorb fan-out bursts, then hand it to tokio.
fn bind_udp_socket(config: &ServerConfig) -> Result<Arc<UdpSocket>> {
    let sock = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .context("failed to create UDP socket")?;
    let _ = sock.set_recv_buffer_size(2 * 1024 * 1024);
    let _ = sock.set_send_buffer_size(2 * 1024 * 1024);
    let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.udp_port)
        .parse()
        .with_context(|| format!("invalid UDP address {}:{}", config.host, config.udp_port))?;
    sock.bind(&addr.into())
        .with_context(|| format!("failed to bind UDP on {}:{}", config.host, config.udp_port))?;
    sock.set_nonblocking(true)
        .context("failed to set non-blocking")?;
    let std_sock: std::net::UdpSocket = sock.into();
    Ok(Arc::new(
        UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")?,
    ))
}

/// Liveness sweep every 5 s. Each pass is re-scheduled from its own
/// completion, so a long sweep delays the next one instead of piling up.
async fn run_liveness_sweep(registry: Arc<Registry>) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        let plan = registry.collect_sweep(clock::now_ms()).await;
        registry.apply_sweep(plan).await;
    }
}

/// Empty-channel garbage collection every 30 s.
async fn run_channel_gc(registry: Arc<Registry>) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        registry.gc_empty_channels().await;
    }
}

/// Handle SIGINT/SIGTERM. The stream loop keeps the handler armed, so a
/// second signal during drain is caught here too: it drains the same
/// session set again instead of falling back to the OS default.
async fn run_signal_handler(registry: Arc<Registry>, shutdown: watch::Sender<bool>) {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("cannot install SIGINT handler: {e}");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("termination signal received, draining sessions");
        let _ = shutdown.send(true);
        registry.close_all_sessions().await;
    }
}
