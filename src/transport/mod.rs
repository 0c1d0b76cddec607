//! Transport layer: the byte streams an endpoint can run over.
//!
//! The engine needs nothing from a connection beyond ordered bytes in both
//! directions, so the [`Transport`] trait is thin: async read/write plus
//! address introspection and a TLS state snapshot for connections that have
//! one. Implementations cover plain TCP, rustls-wrapped TCP (client and
//! server side), and tokio's in-memory duplex pipe.

pub mod dialer;

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls;

use crate::error::{Error, Result};

/// Snapshot of a negotiated TLS session.
#[derive(Debug, Clone)]
pub struct TlsConnectionState {
    /// Negotiated protocol version, if the handshake completed.
    pub protocol_version: Option<rustls::ProtocolVersion>,
    /// Negotiated cipher suite, if the handshake completed.
    pub cipher_suite: Option<rustls::CipherSuite>,
    /// Negotiated ALPN protocol, if any.
    pub alpn_protocol: Option<Vec<u8>>,
}

/// A reliable, ordered, bidirectional byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Local socket address, when the transport has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Remote socket address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// TLS session snapshot.
    ///
    /// Fails with [`Error::NotTlsConnection`] on transports without TLS.
    fn connection_state(&self) -> Result<TlsConnectionState> {
        Err(Error::NotTlsConnection)
    }
}

impl Transport for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl Transport for tokio_rustls::client::TlsStream<TcpStream> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr().ok()
    }

    fn connection_state(&self) -> Result<TlsConnectionState> {
        let (_, session) = self.get_ref();
        Ok(TlsConnectionState {
            protocol_version: session.protocol_version(),
            cipher_suite: session.negotiated_cipher_suite().map(|s| s.suite()),
            alpn_protocol: session.alpn_protocol().map(|p| p.to_vec()),
        })
    }
}

impl Transport for tokio_rustls::server::TlsStream<TcpStream> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr().ok()
    }

    fn connection_state(&self) -> Result<TlsConnectionState> {
        let (_, session) = self.get_ref();
        Ok(TlsConnectionState {
            protocol_version: session.protocol_version(),
            cipher_suite: session.negotiated_cipher_suite().map(|s| s.suite()),
            alpn_protocol: session.alpn_protocol().map(|p| p.to_vec()),
        })
    }
}

/// In-memory pipe, used by tests and demos.
impl Transport for tokio::io::DuplexStream {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_has_no_addresses_or_tls() {
        let (a, _b) = tokio::io::duplex(64);
        assert!(a.local_addr().is_none());
        assert!(a.peer_addr().is_none());
        assert!(matches!(
            a.connection_state(),
            Err(Error::NotTlsConnection)
        ));
    }

    #[tokio::test]
    async fn test_tcp_reports_addresses() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, (server, _)) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });
        let client = client.unwrap();

        assert_eq!(Transport::peer_addr(&client), Some(addr));
        assert!(Transport::local_addr(&client).is_some());
        assert!(matches!(
            client.connection_state(),
            Err(Error::NotTlsConnection)
        ));
        drop(server);
    }
}
