//! DNS over UDP (RFC 1035 §4.2.1).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::Result;
use crate::transport::MAX_DNS_PACKET_SIZE;

/// Largest datagram a DNS message can arrive in.
pub(super) const MAX_DATAGRAM_SIZE: usize = 65535;

/// Receive buffer size for a query advertising `max_payload` bytes.
pub(super) fn reply_buffer_size(max_payload: u16) -> usize {
    usize::from(max_payload).clamp(MAX_DNS_PACKET_SIZE, MAX_DATAGRAM_SIZE)
}

/// Send `query` to `server` and wait for the datagram answering it.
///
/// Replies are read into a buffer of `max_reply` bytes. The socket is
/// connected, so datagrams from other sources are dropped by the kernel;
/// stray replies with a different id are skipped. The caller bounds the wait.
pub(super) async fn exchange(
    server: SocketAddr,
    query: &[u8],
    max_reply: usize,
) -> Result<Vec<u8>> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; max_reply];
    loop {
        let len = socket.recv(&mut buf).await?;
        if len >= 2 && query.len() >= 2 && buf[..2] == query[..2] {
            buf.truncate(len);
            return Ok(buf);
        }
        debug!(server = %server, len, "Ignoring UDP datagram for another query");
    }
}
