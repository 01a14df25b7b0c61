//! DNS proxy orchestration.
//!
//! Binds transports and runs the proxy server.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};

/// Configuration for the DNS proxy.
pub struct ProxyConfig {
    /// Local address to bind (e.g., 127.0.0.1:5353)
    pub bind_addr: SocketAddr,
    /// How often counters are logged and reset
    pub stats_interval: Duration,
    /// How often expired cache entries are dropped
    pub sweep_interval: Duration,
}

impl ProxyConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            stats_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Run the DNS proxy with the given configuration.
///
/// Starts UDP and TCP transports on the bind address and answers every query
/// through `dispatcher`. Runs until interrupted with Ctrl-C.
pub async fn run(config: ProxyConfig, dispatcher: Arc<Dispatcher>) -> io::Result<()> {
    let udp = UdpTransport::bind(config.bind_addr).await?;
    let tcp = TcpTransport::bind(config.bind_addr).await?;

    info!(
        bind = %config.bind_addr,
        primary = %dispatcher.primary().name,
        primary_protocol = %dispatcher.primary().protocol,
        alternative = %dispatcher.alternative().name,
        alternative_protocol = %dispatcher.alternative().protocol,
        "DNS proxy listening"
    );

    udp.start(Arc::clone(&dispatcher));
    tcp.start(Arc::clone(&dispatcher));

    tokio::spawn(log_stats(Arc::clone(&dispatcher), config.stats_interval));
    tokio::spawn(sweep_cache(dispatcher, config.sweep_interval));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}

async fn log_stats(dispatcher: Arc<Dispatcher>, period: Duration) {
    let started = Instant::now();
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let stats = dispatcher.stats_snapshot_and_reset();
        info!(
            uptime_secs = started.elapsed().as_secs(),
            cache = dispatcher.cache_len(),
            requests = stats.requests,
            rejected = stats.rejected,
            hosts = stats.hosts,
            literal = stats.literal,
            cached = stats.cached,
            primary = stats.primary,
            alternative = stats.alternative,
            failed = stats.failed,
            avg_response_ms = format_args!("{:.2}", stats.avg_response_ms),
            "stats"
        );
    }
}

async fn sweep_cache(dispatcher: Arc<Dispatcher>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = dispatcher.sweep_cache();
        if removed > 0 {
            debug!(removed, remaining = dispatcher.cache_len(), "Swept expired cache entries");
        }
    }
}
