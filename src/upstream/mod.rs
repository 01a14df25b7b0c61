//! Outbound exchanges with upstream resolvers.
//!
//! [`UpstreamClient`] is the seam the dispatcher talks through; the
//! [`NetworkClient`] implementation speaks UDP, TCP and DNS-over-TLS, optionally
//! through a SOCKS5 proxy, and attaches an EDNS Client Subnet hint.

pub mod ecs;
mod socks5;
pub mod tcp;
mod tls;
mod udp;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use serde::{Deserialize, Deserializer};
use tokio::net::{TcpStream, lookup_host};
use tracing::{debug, trace};

use crate::error::{Error, Result};
pub use ecs::EcsPolicy;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);
const DNS_PORT: u16 = 53;
const DOT_PORT: u16 = 853;

/// Wire protocol used to reach an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
    /// DNS-over-TLS (RFC 7858)
    TcpTls,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::TcpTls => "tcp-tls",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Protocol::TcpTls => DOT_PORT,
            _ => DNS_PORT,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured upstream resolver group.
#[derive(Debug, Clone, Deserialize)]
pub struct Upstream {
    pub name: String,
    /// `host:port`, or `servername:port@ip` to dial `ip:port` while
    /// verifying TLS against `servername`.
    pub address: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_secs")]
    pub timeout: Duration,
    #[serde(default)]
    pub socks5_address: Option<SocketAddr>,
    #[serde(default)]
    pub edns_client_subnet: EcsPolicy,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

impl Upstream {
    pub fn new(name: impl Into<String>, address: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            protocol,
            timeout: DEFAULT_TIMEOUT,
            socks5_address: None,
            edns_client_subnet: EcsPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_socks5(mut self, proxy: SocketAddr) -> Self {
        self.socks5_address = Some(proxy);
        self
    }

    pub fn with_ecs(mut self, policy: EcsPolicy) -> Self {
        self.edns_client_subnet = policy;
        self
    }

    /// Split the configured address into a dial target and TLS server name.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let invalid = |reason: &str| Error::InvalidUpstream {
            address: self.address.clone(),
            reason: reason.to_string(),
        };

        let (named, dial_ip) = match self.address.split_once('@') {
            Some((named, ip)) => {
                let ip: IpAddr = ip
                    .trim()
                    .parse()
                    .map_err(|_| invalid("expected an IP address after '@'"))?;
                (named.trim(), Some(ip))
            }
            None => (self.address.trim(), None),
        };

        let (host, port) = split_host_port(named, self.protocol.default_port())
            .ok_or_else(|| invalid("expected host:port"))?;

        Ok(match dial_ip {
            Some(ip) => Endpoint {
                host: ip.to_string(),
                port,
                server_name: host,
            },
            None => Endpoint {
                server_name: host.clone(),
                host,
                port,
            },
        })
    }
}

/// Where to dial an upstream, and which name to expect on its certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub server_name: String,
}

impl Endpoint {
    /// Resolve the dial target, looking host names up when needed.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| Error::InvalidUpstream {
                address: self.host.clone(),
                reason: "host name did not resolve".into(),
            })
    }
}

/// Split `host:port`, `[v6]:port`, bare `v6`, or bare `host`.
fn split_host_port(s: &str, default_port: u16) -> Option<(String, u16)> {
    if s.is_empty() {
        return None;
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some((addr.ip().to_string(), addr.port()));
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some((ip.to_string(), default_port));
    }
    if let Some(rest) = s.strip_prefix('[') {
        let (ip, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((ip.to_string(), port));
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            Some((host.to_string(), port.parse().ok()?))
        }
        Some(_) => None,
        None => Some((s.to_string(), default_port)),
    }
}

/// Performs one exchange with one upstream.
///
/// Transport failures come back as `Err`; the caller decides what a missing
/// answer means.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn exchange(
        &self,
        request: &Message,
        upstream: &Upstream,
        ecs_ip: Option<IpAddr>,
    ) -> Result<Message>;
}

/// [`UpstreamClient`] that talks to real resolvers over the network.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkClient;

impl NetworkClient {
    pub fn new() -> Self {
        Self
    }

    async fn round_trip(
        &self,
        query: &[u8],
        max_reply: usize,
        upstream: &Upstream,
    ) -> Result<Vec<u8>> {
        let endpoint = upstream.endpoint()?;
        let target = endpoint.resolve().await?;

        match (upstream.socks5_address, upstream.protocol) {
            (Some(proxy), Protocol::TcpTls) => {
                let stream = socks5::connect(proxy, target).await?;
                tls::exchange(stream, &endpoint.server_name, query).await
            }
            (Some(proxy), _) => {
                let mut stream = socks5::connect(proxy, target).await?;
                tcp::exchange_on(&mut stream, query).await
            }
            (None, Protocol::Udp) => {
                let reply = udp::exchange(target, query, max_reply).await?;
                if is_truncated(&reply) {
                    debug!(upstream = %upstream.name, "Truncated UDP reply, retrying over TCP");
                    tcp::exchange(target, query).await
                } else {
                    Ok(reply)
                }
            }
            (None, Protocol::Tcp) => tcp::exchange(target, query).await,
            (None, Protocol::TcpTls) => {
                let stream = TcpStream::connect(target).await?;
                tls::exchange(stream, &endpoint.server_name, query).await
            }
        }
    }
}

#[async_trait]
impl UpstreamClient for NetworkClient {
    async fn exchange(
        &self,
        request: &Message,
        upstream: &Upstream,
        ecs_ip: Option<IpAddr>,
    ) -> Result<Message> {
        let id = fastrand::u16(..);
        let mut query = request.clone();
        query.set_id(id).set_recursion_desired(true);
        ecs::apply(&mut query, ecs_ip);
        let subnet = ecs::client_subnet(&query);

        let bytes = query.to_vec()?;
        let max_reply = udp::reply_buffer_size(query.max_payload());
        let exchange = self.round_trip(&bytes, max_reply, upstream);
        let reply = tokio::time::timeout(upstream.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout {
                upstream: upstream.name.clone(),
                timeout: upstream.timeout,
            })??;

        let response = Message::from_vec(&reply)?;
        if response.id() != id {
            return Err(Error::IdMismatch {
                expected: id,
                got: response.id(),
            });
        }

        let echoed = ecs::client_subnet(&response).or(subnet);
        debug!(
            upstream = %upstream.name,
            protocol = %upstream.protocol,
            subnet = ?echoed,
            rcode = ?response.response_code(),
            answers = response.answers().len(),
            "Upstream answered"
        );
        for record in response.answers() {
            trace!(upstream = %upstream.name, record = %record, "Answer");
        }

        Ok(response)
    }
}

fn is_truncated(reply: &[u8]) -> bool {
    reply.len() > 2 && reply[2] & 0x02 != 0
}
