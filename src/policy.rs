//! Choosing between raced primary and alternative answers.

use hickory_proto::op::Message;

use crate::dns::{answer_addresses, has_answers};
use crate::matcher::IpNetworkList;

/// Which of the two raced responses to trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    Primary,
    Alternative,
    Neither,
}

/// Pick the response to return after racing both upstreams.
///
/// The primary answer is trusted when it has records and either carries no
/// addresses at all (CNAME-only, MX, TXT...) or at least one address lies
/// inside `trusted`. Otherwise the alternative wins if it has any answer.
/// Arrival order never matters.
pub fn select(
    primary: Option<&Message>,
    alternative: Option<&Message>,
    trusted: &IpNetworkList,
) -> Choice {
    if let Some(primary) = primary.filter(|m| has_answers(m)) {
        let mut addresses = answer_addresses(primary).peekable();
        if addresses.peek().is_none() || addresses.any(|ip| trusted.contains(ip)) {
            return Choice::Primary;
        }
    }

    if alternative.is_some_and(has_answers) {
        Choice::Alternative
    } else {
        Choice::Neither
    }
}
