use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};

use tcptun::{Tunnel, TunnelConfig};

/// User-space tun/tap over TCP tunnel with rate pacing and backward
/// congestion signalling.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Name of the tun/tap interface to attach to
    #[arg(short, long)]
    iface: String,
    /// Run as the server end: listen and accept a single peer
    #[arg(short, long, conflicts_with = "connect")]
    server: bool,
    /// Run as the client end and connect to this server address
    #[arg(short, long, value_name = "IP")]
    connect: Option<Ipv4Addr>,
    /// Carrier port to listen on (server) or connect to (client)
    #[arg(short, long, default_value_t = 55555)]
    port: u16,
    /// Attach a tun (layer 3) interface; this is the default
    #[arg(short = 'u', long, conflicts_with = "tap")]
    tun: bool,
    /// Attach a tap (layer 2) interface instead of tun
    #[arg(short = 'a', long)]
    tap: bool,
    /// Trace packets and queue state to stderr
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if !args.server && args.connect.is_none() {
        anyhow::bail!("one of --server or --connect <IP> is required");
    }
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let mut config = tun_rs::Configuration::default();
    config.name(&args.iface).up();
    if args.tap {
        config.layer(tun_rs::Layer::L2);
    }
    let dev = tun_rs::create_as_async(&config)
        .with_context(|| format!("attaching to interface {}", args.iface))?;
    log::info!("attached to interface {}", args.iface);

    let sock = if let Some(server_ip) = args.connect {
        let addr = SocketAddr::from((server_ip, args.port));
        let sock = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        log::info!("client: connected to server {addr}");
        sock
    } else {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, args.port))
            .await
            .with_context(|| format!("binding port {}", args.port))?;
        let (sock, peer) = listener.accept().await.context("waiting for the peer")?;
        log::info!("server: client connected from {peer}");
        sock
    };
    // pacing is the whole point: do not let Nagle re-batch the carrier
    sock.set_nodelay(true)?;

    let config = TunnelConfig {
        spoofing: !args.tap,
        ..TunnelConfig::default()
    };
    Tunnel::new(dev, sock, config).run().await?;
    Ok(())
}
