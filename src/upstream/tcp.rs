//! DNS over TCP framing (RFC 1035 §4.2.2).
//!
//! Every message is preceded by its length as a 2-byte big-endian integer.
//! The helpers are generic over the stream so the same framing serves plain
//! TCP, TLS and SOCKS5 tunnels, and the inbound TCP listener.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Result;

/// Connect to `server`, send `query` and read one reply.
pub(super) async fn exchange(server: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;
    exchange_on(&mut stream, query).await
}

/// Send `query` and read one reply over an established stream.
pub(super) async fn exchange_on<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, query).await?;
    Ok(read_message(stream).await?)
}

/// Write one length-prefixed message.
pub async fn write_message<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "DNS message over 65535 bytes"))?;

    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await?;
    stream.flush().await
}

/// Read one length-prefixed message.
pub async fn read_message<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;

    let mut message = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut message).await?;
    Ok(message)
}
