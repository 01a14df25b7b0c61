use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use switchback::config::Config;
use switchback::dispatcher::Dispatcher;
use switchback::proxy::{self, ProxyConfig};
use switchback::upstream::NetworkClient;

#[derive(Parser)]
#[command(name = "switchback")]
#[command(about = "Races two DNS resolvers and keeps the trusted answer", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Bind address, overriding the configuration file
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    info!(path = %args.config.display(), "Configuration loaded");

    let dispatcher_config = config
        .dispatcher_config()
        .context("failed to prepare dispatcher")?;
    let dispatcher = Arc::new(Dispatcher::new(dispatcher_config, Arc::new(NetworkClient::new())));

    let bind_addr = args.bind.unwrap_or(config.bind_address);
    proxy::run(ProxyConfig::new(bind_addr), dispatcher)
        .await
        .with_context(|| format!("proxy on {bind_addr} failed"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(args))
}
