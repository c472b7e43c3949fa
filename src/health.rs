//! Liveness/readiness probes: a bare-bones HTTP responder so orchestration
//! platforms can check the daemon without speaking WebSocket.

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Answer every request on `addr` with a 200 JSON status until the token
/// fires. Both probe paths get the same answer; a process that can accept
/// and reply is both alive and ready.
pub async fn serve_probes(addr: &str, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("can't bind health probes to '{addr}'"))?;
    info!(
        addr = %addr,
        paths = ?["/health/liveness", "/health/readiness"],
        "listening to health probe HTTP requests"
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            conn = listener.accept() => {
                let (mut stream, _) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "health probe accept error");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    let mut request = vec![0u8; 1024];
                    let _ = stream.read(&mut request).await;

                    let body = serde_json::json!({
                        "status": "ok",
                        "version": env!("CARGO_PKG_VERSION"),
                    })
                    .to_string();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        }
    }
}
