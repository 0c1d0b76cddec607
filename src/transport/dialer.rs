//! Dialing with transparent retry.
//!
//! Connection attempts back off exponentially and give up after a bounded
//! number of tries; the last underlying error is returned. TLS dialing is a
//! plain dial followed by a rustls client handshake, so an endpoint built on
//! the returned stream sees a fully-established session.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::sleep;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::Result;

/// Connection attempts before giving up.
const MAX_ATTEMPTS: u32 = 5;

/// Backoff after the first failed attempt; doubles per attempt.
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Open a TCP connection, retrying with exponential backoff.
pub async fn dial<A: ToSocketAddrs + Clone>(addr: A) -> Result<TcpStream> {
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match TcpStream::connect(addr.clone()).await {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                debug!(attempt, error = %err, "dial attempt failed");
                last_err = Some(err);
            }
        }
        if attempt + 1 < MAX_ATTEMPTS {
            sleep(BASE_BACKOFF * 2u32.pow(attempt)).await;
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "dial failed"))
        .into())
}

/// Open a TCP connection (with retry) and complete a TLS client handshake.
pub async fn dial_tls<A: ToSocketAddrs + Clone>(
    addr: A,
    server_name: ServerName<'static>,
    config: Arc<ClientConfig>,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let conn = dial(addr).await?;
    let connector = TlsConnector::from(config);
    let stream = connector.connect(server_name, conn).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_immediate_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (conn, accepted) =
            tokio::join!(dial(addr), async { listener.accept().await.unwrap() });
        let conn = conn.unwrap();
        assert_eq!(conn.peer_addr().unwrap(), addr);
        drop(accepted);
    }

    #[tokio::test]
    async fn test_dial_retries_until_listener_appears() {
        // Reserve a port, free it, then bring the listener up late.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let listener_task = tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            listener.accept().await.unwrap()
        });

        let conn = dial(addr).await.unwrap();
        assert_eq!(conn.peer_addr().unwrap(), addr);
        listener_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_gives_up_with_last_error() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let res = dial(addr).await;
        assert!(matches!(res, Err(Error::Io(_))));
    }
}
