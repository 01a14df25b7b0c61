//! EDNS Client Subnet (RFC 7871) source selection and message handling.

use std::net::IpAddr;

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use ipnet::IpNet;
use serde::Deserialize;

use crate::dns::EDNS_PAYLOAD;
use crate::matcher::is_reserved;

/// Prefix length announced for IPv4 client subnets.
pub const IPV4_SOURCE_PREFIX: u8 = 24;
/// Prefix length announced for IPv6 client subnets.
pub const IPV6_SOURCE_PREFIX: u8 = 56;

const FAMILY_IPV4: u16 = 1;
const FAMILY_IPV6: u16 = 2;

/// Which address, if any, an upstream is told the client sits behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum EcsPolicy {
    /// Never send a subnet hint.
    #[default]
    #[serde(alias = "disabled")]
    Disable,
    /// Use the inbound client address, or `external_ip` when the client
    /// address is missing or reserved.
    Auto {
        #[serde(default)]
        external_ip: Option<IpAddr>,
    },
    /// Always use `external_ip`, provided it is a public address.
    Manual {
        #[serde(default)]
        external_ip: Option<IpAddr>,
    },
}

impl EcsPolicy {
    /// Pick the subnet hint for a query from `inbound_ip`.
    ///
    /// IPv4-mapped IPv6 addresses (from a dual-stack listener) count as IPv4.
    pub fn resolve(&self, inbound_ip: Option<IpAddr>) -> Option<IpAddr> {
        match self {
            EcsPolicy::Disable => None,
            EcsPolicy::Auto { external_ip } => match inbound_ip.map(|ip| ip.to_canonical()) {
                Some(ip) if !is_reserved(ip) => Some(ip),
                _ => external_ip.map(|ip| ip.to_canonical()),
            },
            EcsPolicy::Manual { external_ip } => external_ip
                .map(|ip| ip.to_canonical())
                .filter(|ip| !is_reserved(*ip)),
        }
    }
}

/// Attach a client subnet option for `ip` unless the message already has one.
///
/// The address is truncated to the announced prefix before it leaves.
pub fn apply(message: &mut Message, ip: Option<IpAddr>) {
    let Some(ip) = ip else {
        return;
    };
    if client_subnet(message).is_some() {
        return;
    }

    let ip = ip.to_canonical();
    let prefix = match ip {
        IpAddr::V4(_) => IPV4_SOURCE_PREFIX,
        IpAddr::V6(_) => IPV6_SOURCE_PREFIX,
    };
    let network = IpNet::new(ip, prefix)
        .map(|net| net.trunc().addr())
        .unwrap_or(ip);

    let edns = message.extensions_mut().get_or_insert_with(|| {
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        edns
    });
    edns.options_mut()
        .insert(EdnsOption::Subnet(ClientSubnet::new(network, prefix, 0)));
}

/// The client subnet address carried by `message`, if any.
pub fn client_subnet(message: &Message) -> Option<IpAddr> {
    match message.extensions().as_ref()?.option(EdnsCode::Subnet)? {
        EdnsOption::Subnet(subnet) => subnet_address(subnet),
        _ => None,
    }
}

/// Remove any client subnet option from `message`.
pub fn strip(message: &mut Message) {
    if let Some(edns) = message.extensions_mut().as_mut() {
        edns.options_mut().remove(EdnsCode::Subnet);
    }
}

/// Read the address out of the option's wire form: family, source prefix,
/// scope prefix, then the significant address octets.
fn subnet_address(subnet: &ClientSubnet) -> Option<IpAddr> {
    let bytes = Vec::<u8>::try_from(subnet).ok()?;
    let (header, octets) = bytes.split_at_checked(4)?;

    match u16::from_be_bytes([header[0], header[1]]) {
        FAMILY_IPV4 => {
            let mut addr = [0u8; 4];
            let len = octets.len().min(addr.len());
            addr[..len].copy_from_slice(&octets[..len]);
            Some(IpAddr::from(addr))
        }
        FAMILY_IPV6 => {
            let mut addr = [0u8; 16];
            let len = octets.len().min(addr.len());
            addr[..len].copy_from_slice(&octets[..len]);
            Some(IpAddr::from(addr))
        }
        _ => None,
    }
}
