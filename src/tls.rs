//! streaming TLS adapter.
//!
//! the core only assumes a non-blocking, progressable TLS handshake over an already-connected
//! socket; it does not implement TLS itself. rendered as a closed two-variant enum instead of a
//! type-erased trait object, since the core only ever needs "plain TCP" or "rustls over TCP".

use core::{
    pin::Pin,
    task::{Context, Poll},
};
use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::error::Error;

/// type-erased connected socket, plain or TLS, rendered as a closed enum since only two
/// concrete transports are supported.
pub enum Io {
    Tcp(TcpStream),
    #[cfg(feature = "rustls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Io {
    pub(crate) fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nodelay(nodelay),
            #[cfg(feature = "rustls")]
            Self::Tls(s) => s.get_ref().0.set_nodelay(nodelay),
        }
    }
}

impl AsyncRead for Io {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "rustls")]
            Self::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Io {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "rustls")]
            Self::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "rustls")]
            Self::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "rustls")]
            Self::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
        }
    }
}

/// drive the TLS handshake for `stream` against `server_name`, returning the type-erased
/// connected socket. this is the "SSL_HANDSHAKE" phase of the state graph; the driver treats it
/// as an opaque await and never inspects handshake progress directly, since `tokio-rustls`
/// already implements the want-read/want-write bookkeeping internally.
#[cfg(feature = "rustls")]
pub(crate) async fn handshake(stream: TcpStream, server_name: &str) -> Result<Io, Error> {
    use std::sync::{Arc, OnceLock};
    use tokio_rustls::rustls::{pki_types::ServerName, ClientConfig, RootCertStore};

    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();

    let config = CONFIG
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone();

    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| Error::Std(Box::new(e)))?;

    let connector = tokio_rustls::TlsConnector::from(config);
    let stream = connector.connect(name, stream).await?;
    Ok(Io::Tls(Box::new(stream)))
}

#[cfg(not(feature = "rustls"))]
pub(crate) async fn handshake(_stream: TcpStream, _server_name: &str) -> Result<Io, Error> {
    Err(Error::Std(
        "https target requires the `rustls` crate feature".into(),
    ))
}
