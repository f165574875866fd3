//! linknet binary: CLI parsing, process wiring, and ordered shutdown.
//!
//! Usage:
//!   Server: linknet --mode server --local-tun-ip 10.0.1.1 --remote-tun-ip 10.0.1.2 --psk-file /etc/linknet.psk
//!   Client: linknet --mode client --remote-ip 1.2.3.4 --local-tun-ip 10.0.1.2 --remote-tun-ip 10.0.1.1 --psk-file /etc/linknet.psk

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use linknet::config::{Config, Mode, DEFAULT_MTU, DEFAULT_RECONNECT_INTERVAL};
use linknet::{routes, Bridge, TunDevice};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "linknet")]
#[command(version)]
#[command(about = "Point-to-point layer-3 VPN over an authenticated, encrypted TCP connection")]
struct Args {
    /// Operation mode
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// TUN device name
    #[arg(long, default_value = "tun0")]
    dev: String,

    /// TCP port
    #[arg(long, default_value_t = 51860)]
    port: u16,

    /// Remote server IP or hostname (required in client mode)
    #[arg(long = "remote-ip")]
    remote_ip: Option<String>,

    /// Local TUN IP address
    #[arg(long = "local-tun-ip")]
    local_tun_ip: Option<Ipv4Addr>,

    /// Remote TUN IP address
    #[arg(long = "remote-tun-ip")]
    remote_tun_ip: Option<Ipv4Addr>,

    /// Pre-shared key for encryption
    #[arg(long)]
    psk: Option<String>,

    /// Read the pre-shared key from a file
    #[arg(long = "psk-file")]
    psk_file: Option<PathBuf>,

    /// Disable encryption (for debugging only)
    #[arg(long = "no-encryption")]
    no_encryption: bool,

    /// Add a host route to the remote TUN address on startup
    #[arg(long = "enable-route")]
    enable_route: bool,

    /// Generate a 64-character pre-shared key on stdout and exit
    #[arg(long = "generate-psk")]
    generate_psk: bool,

    /// Log level
    #[arg(long = "log-level", value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn build_config(args: &Args) -> Result<Config> {
    let Some(mode) = args.mode else {
        bail!("--mode is required ('client' or 'server')");
    };
    let Some(local_tun_ip) = args.local_tun_ip else {
        bail!("--local-tun-ip is required");
    };
    let Some(remote_tun_ip) = args.remote_tun_ip else {
        bail!("--remote-tun-ip is required");
    };

    let psk = match (&args.psk, &args.psk_file) {
        (Some(_), Some(_)) => bail!("--psk and --psk-file are mutually exclusive"),
        (Some(psk), None) => Some(psk.clone()),
        (None, Some(path)) => Some(linknet::config::load_psk_file(path)?),
        (None, None) => None,
    };

    let config = Config {
        mode,
        remote_host: args.remote_ip.clone(),
        port: args.port,
        tun_name: args.dev.clone(),
        local_tun_ip,
        remote_tun_ip,
        tun_mtu: DEFAULT_MTU,
        psk,
        enable_encryption: !args.no_encryption,
        enable_keepalive: true,
        reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        enable_auto_route: args.enable_route,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_psk {
        println!("{}", linknet::generate_psk());
        return Ok(());
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.log_level.as_filter()),
    )
    .init();

    let config = build_config(&args)?;

    log::info!("mode: {}", config.mode);
    log::info!("device: {} (mtu {})", config.tun_name, config.tun_mtu);
    log::info!(
        "tunnel: {} <-> {} on port {}",
        config.local_tun_ip,
        config.remote_tun_ip,
        config.port
    );
    if !config.enable_encryption {
        log::warn!("encryption disabled, traffic will be sent in the clear");
    }

    let tun = TunDevice::create(&config).context("failed to set up TUN device")?;

    // Routes are removed when the guard drops at the end of main, after the
    // bridge has stopped and the TUN device is gone.
    let _route_guard = if config.enable_auto_route {
        Some(
            routes::add_routes(tun.name(), &[config.remote_tun_ip])
                .await
                .context("failed to add route")?,
        )
    } else {
        None
    };

    let bridge = Arc::new(Bridge::new(config)?);

    let mut bridge_task = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.run(tun).await }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = &mut bridge_task => {
            result.context("bridge task failed")??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received interrupt, shutting down");
        }
        _ = sigterm.recv() => {
            log::info!("received terminate signal, shutting down");
        }
    }

    bridge.stop();
    bridge_task.await.context("bridge task failed")??;
    log::info!("shutdown complete");
    Ok(())
}
