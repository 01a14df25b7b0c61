//! UDP transport for DNS queries.
//!
//! Each datagram is answered by its own task, so a slow upstream never holds
//! up other clients.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::dns::encode_for_udp;

use super::{MAX_DNS_PACKET_SIZE, answer};

/// UDP listener for the proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the receive loop.
    pub fn start(self, dispatcher: Arc<Dispatcher>) {
        tokio::spawn(run(self.socket, dispatcher));
    }
}

async fn run(socket: Arc<UdpSocket>, dispatcher: Arc<Dispatcher>) {
    let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP recv error");
                continue;
            }
        };

        let query = buf[..len].to_vec();
        let socket = Arc::clone(&socket);
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            handle_query(&socket, &dispatcher, &query, peer).await;
        });
    }
}

async fn handle_query(socket: &UdpSocket, dispatcher: &Dispatcher, query: &[u8], peer: SocketAddr) {
    let Some((request, response)) = answer(dispatcher, query, peer, "udp").await else {
        return;
    };

    let bytes = match encode_for_udp(&response, request.max_payload() as usize) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to encode UDP response");
            return;
        }
    };

    if let Err(e) = socket.send_to(&bytes, peer).await {
        debug!(peer = %peer, error = %e, "UDP response error");
    }
}
