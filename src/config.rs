//! TOML configuration file.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::rr::RecordType;
use serde::Deserialize;
use tracing::{info, warn};

use crate::cache::ResponseCache;
use crate::dispatcher::{DispatcherConfig, Fallback};
use crate::error::{Error, Result};
use crate::hosts::HostsTable;
use crate::matcher::{DomainList, IpNetworkList};
use crate::upstream::Upstream;

/// Response cache settings. A `size` of 0 disables the cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub size: usize,
    /// Seconds.
    pub min_ttl: u64,
    /// Seconds.
    pub max_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: 4096,
            min_ttl: 60,
            max_ttl: 86400,
        }
    }
}

/// Top-level configuration.
///
/// List and hosts file paths are relative to the directory holding the
/// configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
    #[serde(default)]
    pub only_primary_dns: bool,
    #[serde(default)]
    pub ipv6_use_alternative_dns: bool,
    #[serde(default)]
    pub when_primary_dns_answer_none_use: Fallback,
    #[serde(default)]
    pub minimum_ttl: u32,
    #[serde(default)]
    pub reject_qtypes: Vec<String>,
    pub hosts_file: Option<PathBuf>,
    pub domain_primary_file: Option<PathBuf>,
    pub domain_alternative_file: Option<PathBuf>,
    pub ip_network_primary_file: Option<PathBuf>,
    #[serde(default)]
    pub cache: CacheConfig,
    pub primary_dns: Upstream,
    pub alternative_dns: Upstream,
    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5353))
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

impl Config {
    /// Read and parse the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;

        let mut config: Config = text.parse()?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    /// Load the referenced files and assemble the dispatcher settings.
    pub fn dispatcher_config(&self) -> Result<DispatcherConfig> {
        for upstream in [&self.primary_dns, &self.alternative_dns] {
            if let Err(e) = upstream.endpoint() {
                warn!(upstream = %upstream.name, error = %e, "Upstream will fail every exchange");
            }
        }

        let reject_qtypes = self
            .reject_qtypes
            .iter()
            .map(|name| {
                RecordType::from_str(&name.to_ascii_uppercase())
                    .map_err(|_| Error::Config(format!("unknown query type {name:?}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let hosts = match self.read_optional(self.hosts_file.as_deref())? {
            Some(text) => HostsTable::parse(&text),
            None => HostsTable::new(),
        };
        let domain_primary =
            self.load_list(self.domain_primary_file.as_deref(), DomainList::parse)?;
        let domain_alternative =
            self.load_list(self.domain_alternative_file.as_deref(), DomainList::parse)?;
        let ip_network_primary =
            self.load_list(self.ip_network_primary_file.as_deref(), IpNetworkList::parse)?;

        info!(
            hosts = hosts.len(),
            domain_primary = domain_primary.len(),
            domain_alternative = domain_alternative.len(),
            ip_network_primary = ip_network_primary.len(),
            "Loaded lists"
        );

        let cache = (self.cache.size > 0).then(|| {
            ResponseCache::with_ttl_bounds(
                self.cache.size,
                Duration::from_secs(self.cache.min_ttl),
                Duration::from_secs(self.cache.max_ttl),
            )
        });

        Ok(DispatcherConfig {
            primary: self.primary_dns.clone(),
            alternative: self.alternative_dns.clone(),
            only_primary: self.only_primary_dns,
            redirect_ipv6: self.ipv6_use_alternative_dns,
            fallback: self.when_primary_dns_answer_none_use,
            minimum_ttl: self.minimum_ttl,
            reject_qtypes,
            domain_primary,
            domain_alternative,
            ip_network_primary,
            hosts,
            cache,
        })
    }

    fn load_list<T: Default>(&self, path: Option<&Path>, parse: fn(&str) -> T) -> Result<T> {
        Ok(self
            .read_optional(path)?
            .map(|text| parse(&text))
            .unwrap_or_default())
    }

    fn read_optional(&self, path: Option<&Path>) -> Result<Option<String>> {
        let Some(path) = path else {
            return Ok(None);
        };
        let path = self.base_dir.join(path);
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))
    }
}
