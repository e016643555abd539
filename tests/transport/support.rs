// Test support - minimal canned-response HTTP stub

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

/// Serve one canned response to every connection. Returns the base URL and
/// the captured request heads for path/method assertions.
pub async fn http_stub(
    status: u16,
    content_type: &str,
    body: &[u8],
) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    let requests = Arc::new(Mutex::new(Vec::new()));

    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason(status),
        content_type,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);

    let captured = requests.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let response = response.clone();
            let captured = captured.clone();
            tokio::spawn(async move {
                // Drain the request until the client goes idle; headers and
                // body may arrive in separate writes.
                let mut data = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let read = tokio::time::timeout(
                        std::time::Duration::from_millis(50),
                        stream.read(&mut buf),
                    )
                    .await;
                    match read {
                        Ok(Ok(n)) if n > 0 => data.extend_from_slice(&buf[..n]),
                        _ => break,
                    }
                }
                captured
                    .lock()
                    .await
                    .push(String::from_utf8_lossy(&data).to_string());
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{}", addr), requests)
}

/// A bound-then-closed address, for connection-refused scenarios
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{}", addr)
}
