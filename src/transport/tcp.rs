//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently and may carry several
//! length-prefixed queries; they are answered in order until the client
//! closes the connection or goes idle.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;
use crate::upstream::tcp::{read_message, write_message};

use super::answer;

/// Idle time after which a client connection is closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP listener for the proxy.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the accept loop; each connection gets its own task.
    pub fn start(self, dispatcher: Arc<Dispatcher>) {
        tokio::spawn(run_accept_loop(self.listener, dispatcher));
    }
}

async fn run_accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(client, peer, Arc::clone(&dispatcher)));
            }
            Err(e) => {
                warn!(error = %e, "TCP accept error");
            }
        }
    }
}

async fn handle_connection(mut client: TcpStream, peer: SocketAddr, dispatcher: Arc<Dispatcher>) {
    loop {
        let query = match tokio::time::timeout(IDLE_TIMEOUT, read_message(&mut client)).await {
            Ok(Ok(query)) => query,
            // closed, broken or idle
            Ok(Err(_)) | Err(_) => return,
        };

        let Some((_, response)) = answer(&dispatcher, &query, peer, "tcp").await else {
            return;
        };

        let bytes = match response.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to encode TCP response");
                return;
            }
        };

        if let Err(e) = write_message(&mut client, &bytes).await {
            debug!(peer = %peer, error = %e, "TCP response error");
            return;
        }
    }
}
