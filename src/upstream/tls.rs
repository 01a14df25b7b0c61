//! DNS-over-TLS (RFC 7858): TCP framing inside a TLS session.

use std::sync::{Arc, LazyLock};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

use super::tcp;
use crate::error::{Error, Result};

static TLS_CONFIG: LazyLock<Arc<ClientConfig>> = LazyLock::new(|| {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

/// Run a TLS handshake for `server_name` over `stream`, then exchange one
/// framed message.
pub(super) async fn exchange<S>(stream: S, server_name: &str, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {server_name:?}: {e}")))?;

    let mut tls = TlsConnector::from(Arc::clone(&TLS_CONFIG))
        .connect(name, stream)
        .await
        .map_err(|e| Error::Tls(format!("handshake with {server_name} failed: {e}")))?;

    tcp::exchange_on(&mut tls, query).await
}
