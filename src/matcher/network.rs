//! CIDR network lists.

use std::net::IpAddr;
use std::sync::LazyLock;

use ipnet::IpNet;
use tracing::warn;

use super::list_lines;

/// Networks that never identify a client on the public internet.
const RESERVED_NETWORKS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "::/128",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

static RESERVED: LazyLock<IpNetworkList> =
    LazyLock::new(|| RESERVED_NETWORKS.iter().copied().collect());

/// Whether `ip` belongs to a private, loopback, link-local or otherwise
/// reserved range.
pub fn is_reserved(ip: IpAddr) -> bool {
    RESERVED.contains(ip)
}

/// A set of CIDR ranges.
#[derive(Debug, Clone, Default)]
pub struct IpNetworkList {
    networks: Vec<IpNet>,
}

impl IpNetworkList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a list with one CIDR range or bare address per line.
    ///
    /// Malformed lines are logged and skipped.
    pub fn parse(text: &str) -> Self {
        list_lines(text).collect()
    }

    /// Add a CIDR range (`10.0.0.0/8`) or a single address (`10.0.0.1`).
    pub fn insert(&mut self, entry: &str) -> bool {
        let network = entry
            .parse::<IpNet>()
            .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from));

        match network {
            Ok(network) => {
                self.networks.push(network.trunc());
                true
            }
            Err(e) => {
                warn!(entry = %entry, error = %e, "Skipping malformed network entry");
                false
            }
        }
    }

    /// Check whether `ip` falls inside any listed range.
    ///
    /// An IPv4-mapped IPv6 address is matched as the IPv4 address it carries.
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.networks.iter().any(|network| network.contains(&ip))
    }

    /// Returns the number of ranges in the list.
    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl<'a> FromIterator<&'a str> for IpNetworkList {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut list = Self::new();
        for entry in iter {
            list.insert(entry);
        }
        list
    }
}
