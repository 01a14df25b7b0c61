//! Domain suffix lists.

use rustc_hash::FxHashSet;

use super::list_lines;
use crate::dns::normalize_str;

/// A set of domain suffixes.
///
/// A name matches when it equals an entry or is a subdomain of one, compared
/// label by label: `ample.com` does not match `example.com`.
#[derive(Debug, Clone, Default)]
pub struct DomainList {
    domains: FxHashSet<String>,
}

impl DomainList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a list with one domain per line.
    ///
    /// `#` starts a comment. A leading `*.` or `.` is accepted and ignored,
    /// since every entry already covers its subdomains.
    pub fn parse(text: &str) -> Self {
        list_lines(text).collect()
    }

    pub fn insert(&mut self, domain: &str) {
        let domain = normalize_str(domain);
        let domain = domain
            .strip_prefix("*.")
            .or_else(|| domain.strip_prefix('.'))
            .unwrap_or(&domain);
        if !domain.is_empty() {
            self.domains.insert(domain.to_string());
        }
    }

    /// Check whether `name` or one of its parent domains is listed.
    pub fn matches(&self, name: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }

        let name = normalize_str(name);
        let mut current = name.as_str();

        loop {
            if self.domains.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return false,
            }
        }
    }

    /// Returns the number of domains in the list.
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl<'a> FromIterator<&'a str> for DomainList {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut list = Self::new();
        for domain in iter {
            list.insert(domain);
        }
        list
    }
}
