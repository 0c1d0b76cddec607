//! Stream fan-out example.
//!
//! The server side installs a new-stream handler; the client opens a stream,
//! sends a few chunks, and closes it. The handler prints each chunk and
//! exits when the close sentinel drains its reader.
//!
//! ```sh
//! cargo run --example stream
//! ```

use framelink::{ops, packet, Endpoint, EndpointConfig};

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

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        let (conn, _) = listener.accept().await.unwrap();
        let done_tx = std::sync::Mutex::new(Some(done_tx));

        let endpoint = Endpoint::with_stream_handler(
            conn,
            EndpointConfig::default(),
            move |stream| {
                let done = done_tx.lock().unwrap().take();
                async move {
                    tracing::info!(id = stream.id(), "new stream opened by peer");
                    while let Ok(p) = stream.read_packet().await {
                        println!("chunk: {}", String::from_utf8_lossy(&p.content));
                        packet::release(p);
                    }
                    tracing::info!(id = stream.id(), "stream closed");
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
            },
        );

        // The client's close reaches us as EOF and flips the close signal.
        let mut close_rx = endpoint.close_channel();
        let _ = close_rx.changed().await;
    });

    let client = Endpoint::connect(addr).await?;

    let stream = client.new_stream(7);
    for chunk in ["alpha", "beta", "gamma"] {
        let mut p = packet::acquire();
        p.header.id = stream.id();
        p.header.operation = ops::STREAM;
        p.set_content(chunk.as_bytes());
        stream.write_packet(&p).await?;
        packet::release(p);
    }
    stream.close().await?;

    done_rx.await?;
    client.close().await?;
    server.await?;
    Ok(())
}
