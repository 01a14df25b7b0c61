//! Static lists the dispatcher routes and validates against.
//!
//! Domain lists force a question to one resolver; the IP network list decides
//! whether an address returned by the primary resolver is plausible. Both are
//! built once at startup and only read afterwards.

mod domain;
mod network;

pub use domain::DomainList;
pub use network::{IpNetworkList, is_reserved};

/// Iterate the meaningful lines of a list file.
///
/// Trims whitespace and drops blank lines and `#` comments, including
/// trailing ones.
fn list_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter_map(|line| {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let line = line.trim();
        if line.is_empty() { None } else { Some(line) }
    })
}
