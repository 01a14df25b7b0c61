//! Inbound transports.
//!
//! Receive DNS queries from clients over UDP and TCP, hand them to the
//! [`Dispatcher`] and write its answer back.

pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use hickory_proto::op::{Message, MessageType};
use tracing::debug;

use crate::dispatcher::Dispatcher;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Length of the fixed DNS header.
const HEADER_LEN: usize = 12;

/// Decode a client query and dispatch it.
///
/// Returns the request alongside the response; `None` when the bytes are not
/// a DNS query worth answering.
async fn answer(
    dispatcher: &Dispatcher,
    query: &[u8],
    peer: SocketAddr,
    transport: &'static str,
) -> Option<(Message, Message)> {
    if query.len() < HEADER_LEN {
        return None;
    }

    let request = match Message::from_vec(query) {
        Ok(request) if request.message_type() == MessageType::Query => request,
        Ok(_) => return None,
        Err(e) => {
            debug!(transport, peer = %peer, error = %e, "Dropping undecodable query");
            return None;
        }
    };

    let response = dispatcher.exchange(&request, Some(peer.ip())).await;
    Some((request, response))
}
