// Raw TcpListener upstream for connector tests. Serves queued
// (status, body) pairs in order, repeating the last one.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct Upstream {
    pub base_url: String,
    paths: Arc<Mutex<Vec<String>>>,
}

impl Upstream {
    pub async fn start(responses: Vec<(u16, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let paths = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&paths);

        tokio::spawn(async move {
            let mut served = 0usize;
            while let Ok((stream, _)) = listener.accept().await {
                let (status, body) = responses
                    .get(served)
                    .or_else(|| responses.last())
                    .copied()
                    .unwrap_or((200, "{}"));
                served += 1;
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    reply(stream, status, body, &seen).await;
                });
            }
        });

        Upstream { base_url, paths }
    }

    /// Request paths (with query string) in arrival order.
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

async fn reply(mut stream: TcpStream, status: u16, body: &str, seen: &Mutex<Vec<String>>) -> Option<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = head.split_whitespace().nth(1)?.to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    seen.lock().push(path);

    let response = format!(
        "HTTP/1.1 {} Upstream\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
    Some(())
}
