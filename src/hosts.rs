//! Static hosts table consulted before any network activity.

use std::net::IpAddr;

use hickory_proto::rr::RecordType;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::dns::normalize_str;

/// Fixed name -> address overrides.
///
/// Parsed from hosts-file text: `address name [name...]`, `#` comments.
/// A `*.example.com` name matches every strict subdomain of `example.com`.
#[derive(Debug, Clone, Default)]
pub struct HostsTable {
    exact: FxHashMap<String, Vec<IpAddr>>,
    wildcard: FxHashMap<String, Vec<IpAddr>>,
}

impl HostsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let mut table = Self::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next() else {
                continue;
            };
            let addr: IpAddr = match addr.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(line = lineno + 1, entry = %addr, error = %e, "Skipping bad hosts entry");
                    continue;
                }
            };
            for name in fields {
                table.insert(name, addr);
            }
        }

        table
    }

    pub fn insert(&mut self, name: &str, addr: IpAddr) {
        let name = normalize_str(name);
        let (map, key) = if name.starts_with("*.") {
            (&mut self.wildcard, name[2..].to_string())
        } else {
            (&mut self.exact, name)
        };
        let addrs = map.entry(key).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    /// Addresses for `name` of the family `qtype` asks for.
    ///
    /// Returns `None` for record types other than A/AAAA, and when the entry
    /// holds no address of the requested family.
    pub fn lookup(&self, name: &str, qtype: RecordType) -> Option<Vec<IpAddr>> {
        let wants_v4 = match qtype {
            RecordType::A => true,
            RecordType::AAAA => false,
            _ => return None,
        };

        let addrs = self.find(&normalize_str(name))?;
        let matching: Vec<IpAddr> = addrs
            .iter()
            .copied()
            .filter(|addr| addr.is_ipv4() == wants_v4)
            .collect();

        if matching.is_empty() { None } else { Some(matching) }
    }

    fn find(&self, name: &str) -> Option<&Vec<IpAddr>> {
        if let Some(addrs) = self.exact.get(name) {
            return Some(addrs);
        }
        if self.wildcard.is_empty() {
            return None;
        }

        let mut current = name;
        while let Some(pos) = current.find('.') {
            current = &current[pos + 1..];
            if let Some(addrs) = self.wildcard.get(current) {
                return Some(addrs);
            }
        }
        None
    }

    /// Returns the number of names in the table.
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
