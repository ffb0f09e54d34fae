//! Minimal HTTP/1.1 responder for adapter tests.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub parts: Vec<String>,
    pub pause: Duration,
}

impl Reply {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "application/json",
            parts: vec![body.into()],
            pause: Duration::ZERO,
        }
    }

    pub fn streamed(content_type: &'static str, parts: &[&str]) -> Self {
        Self {
            status: 200,
            content_type,
            parts: parts.iter().map(|part| part.to_string()).collect(),
            pause: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Serves `replies` in order, one per connection, and returns the base url
/// plus a channel of the requests received.
pub(crate) async fn serve(replies: Vec<Reply>) -> (String, mpsc::UnboundedReceiver<Recorded>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for reply in replies {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let recorded = read_request(&mut socket).await;
            let _ = tx.send(recorded);

            let head = format!(
                "HTTP/1.1 {} Test\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
                reply.status, reply.content_type
            );
            if socket.write_all(head.as_bytes()).await.is_err() {
                continue;
            }
            for part in &reply.parts {
                if socket.write_all(part.as_bytes()).await.is_err() {
                    break;
                }
                let _ = socket.flush().await;
                if !reply.pause.is_zero() {
                    tokio::time::sleep(reply.pause).await;
                }
            }
            let _ = socket.shutdown().await;
        }
    });

    (format!("http://{addr}"), rx)
}

/// A base url nothing listens on.
pub(crate) async fn closed_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{addr}")
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Recorded {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find(&buffer, b"\r\n\r\n") {
            break pos;
        }
        let read = socket.read(&mut chunk).await.expect("read request");
        if read == 0 {
            break buffer.len();
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let body_start = (header_end + 4).min(buffer.len());
    let mut body = buffer[body_start..].to_vec();
    while body.len() < content_length {
        let read = socket.read(&mut chunk).await.expect("read body");
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Recorded {
        request_line,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
