//! Prometheus scrape endpoint

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Bind the scrape endpoint on all interfaces and serve forever
pub async fn start(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!(port = port, "Metrics server listening");
    serve(listener).await
}

/// Answer `GET /metrics` with the default registry; anything else is a 404
pub async fn serve(listener: TcpListener) -> Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = respond(socket).await {
                debug!(peer = %peer, error = %e, "Metrics request failed");
            }
        });
    }
}

async fn respond(mut socket: TcpStream) -> Result<()> {
    let mut buf = [0; 1024];
    let n = socket.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let target = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");

    let response = if target == "/metrics" || target == "/" {
        let body = prometheus::TextEncoder::new()
            .encode_to_string(&prometheus::gather())
            .unwrap_or_default();
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };

    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}
