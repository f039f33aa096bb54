//! The duplex byte channel a `Connection` writes encoded frames to and reads
//! decoded frames from. TLS is opaque above this module: callers only ever
//! see "an established `AsyncRead + AsyncWrite` stream".
//!
//! Generalizes `brocaar-redis-rs::aio::ActualConnection`'s `poll_read`/
//! `poll_write`/`poll_flush`/`poll_shutdown` dispatch over `Tcp`/`Unix` to a
//! third `Tls` variant.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::config::{Address, Config};

pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    /// Establishes the transport described by `config`: TCP (or Unix) connect,
    /// then a TLS handshake with hostname verification if configured. This is
    /// the transport/handshake half of startup; AUTH/SELECT happen above
    /// this layer once the transport is ready.
    pub async fn connect(config: &Config) -> io::Result<Transport> {
        match &config.address {
            Address::Tcp { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port)).await?;
                match &config.tls {
                    Some(tls) => {
                        let hostname = config.hostname.as_deref().ok_or_else(|| {
                            io::Error::new(
                                io::ErrorKind::InvalidInput,
                                "TLS configured without a hostname",
                            )
                        })?;
                        let server_name = ServerName::try_from(hostname.to_string())
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                        let connector = TlsConnector::from(tls.client_config.clone());
                        let stream = connector.connect(server_name, tcp).await?;
                        Ok(Transport::Tls(Box::new(stream)))
                    }
                    None => Ok(Transport::Tcp(tcp)),
                }
            }
            #[cfg(unix)]
            Address::Unix(path) => Ok(Transport::Unix(UnixStream::connect(path).await?)),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
