//! Echo over TCP - simple request/response example.
//!
//! Starts a listener, connects an endpoint to it, and bounces one packet
//! back and forth. The server side echoes whatever payload it reads, on the
//! same packet id.
//!
//! ```sh
//! cargo run --example echo
//! ```

use framelink::{packet, Endpoint};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "framelink=debug".into()),
        )
        .init();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (conn, peer) = listener.accept().await.unwrap();
        tracing::info!(%peer, "accepted connection");
        let endpoint = Endpoint::new(conn);

        let p = endpoint.read_packet().await.unwrap();
        tracing::info!(id = p.header.id, len = p.content.len(), "echoing packet");
        endpoint.write_packet(&p).await.unwrap();
        packet::release(p);

        endpoint.close().await.unwrap();
    });

    let client = Endpoint::connect(addr).await?;

    let mut p = packet::acquire();
    p.header.id = 1;
    p.header.operation = 32;
    p.set_content(b"hello framelink");
    client.write_packet(&p).await?;
    packet::release(p);

    let echoed = client.read_packet().await?;
    println!("echoed: {}", String::from_utf8_lossy(&echoed.content));
    packet::release(echoed);

    client.close().await?;
    server.await?;
    Ok(())
}
