use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::{Client, Config, RetryConfig, LAST_EVENT_ID_HEADER};

/// Create a test client configured to use a local server.
/// Disables retries by default for predictable test behavior.
pub fn test_client(base_url: &str) -> Client {
    Client::new(Config {
        access_token: Some("tok_test".to_string()),
        user_id: Some("user_test".to_string()),
        gateway_url: Some(base_url.to_string()),
        retry: Some(RetryConfig::disabled()),
        ..Default::default()
    })
    .expect("client")
}

/// One scripted event-stream response: frames written with a delay before
/// each, then an optional pause before the connection is closed.
#[derive(Debug, Clone, Default)]
pub struct SseScript {
    pub steps: Vec<(Duration, String)>,
    pub finish_after: Option<Duration>,
    /// Pause before the response headers are written.
    pub headers_after: Option<Duration>,
}

impl SseScript {
    /// Frames written back to back, then closed.
    pub fn frames<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: frames
                .into_iter()
                .map(|frame| (Duration::ZERO, frame.into()))
                .collect(),
            finish_after: None,
            headers_after: None,
        }
    }

    /// Accept the request but hold back the response headers this long.
    pub fn stall_headers(mut self, delay: Duration) -> Self {
        self.headers_after = Some(delay);
        self
    }

    /// Hold the connection open this long after the last frame.
    pub fn hold_open(mut self, delay: Duration) -> Self {
        self.finish_after = Some(delay);
        self
    }
}

/// Format one SSE frame.
pub fn sse_frame(id: Option<&str>, event: &str, data: &str) -> String {
    let mut frame = String::new();
    if let Some(id) = id {
        frame.push_str(&format!("id: {id}\n"));
    }
    frame.push_str(&format!("event: {event}\n"));
    for line in data.lines() {
        frame.push_str(&format!("data: {line}\n"));
    }
    frame.push('\n');
    frame
}

/// Local gateway stand-in serving `.../stream` from scripts and everything
/// else from queued JSON bodies.
///
/// Stream requests beyond the scripts get a 404. Plain requests take the
/// next poll body; the last one repeats.
pub struct SseServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    abandoned: Arc<AtomicUsize>,
}

impl SseServer {
    /// Raw request heads received so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests").clone()
    }

    /// `Last-Event-ID` sent with each stream request, in order.
    pub fn stream_cursors(&self) -> Vec<Option<String>> {
        let needle = format!("{}:", LAST_EVENT_ID_HEADER.to_ascii_lowercase());
        self.requests()
            .iter()
            .filter(|head| request_path(head).ends_with("/stream"))
            .map(|head| {
                head.lines()
                    .find(|line| line.to_ascii_lowercase().starts_with(&needle))
                    .map(|line| line[needle.len()..].trim().to_string())
            })
            .collect()
    }

    /// Stream responses the client closed before the script finished.
    pub fn abandoned_streams(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.requests()
            .iter()
            .filter(|head| !request_path(head).ends_with("/stream"))
            .count()
    }
}

fn request_path(head: &str) -> &str {
    head.lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("")
}

struct Scripts {
    streams: VecDeque<SseScript>,
    polls: VecDeque<String>,
    last_poll: Option<String>,
}

/// Start a local server for the given stream scripts and poll bodies.
pub async fn start_sse_server(streams: Vec<SseScript>, polls: Vec<String>) -> SseServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let requests = Arc::new(Mutex::new(Vec::new()));
    let scripts = Arc::new(Mutex::new(Scripts {
        streams: streams.into(),
        polls: polls.into(),
        last_poll: None,
    }));

    let abandoned = Arc::new(AtomicUsize::new(0));

    let seen = requests.clone();
    let closed = abandoned.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let seen = seen.clone();
            let scripts = scripts.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                serve(socket, seen, scripts, closed).await;
            });
        }
    });

    SseServer {
        base_url: format!("http://{}", addr),
        requests,
        abandoned,
    }
}

/// Start a server that answers a single stream request with `steps`.
pub async fn start_chunked_sse_server(
    steps: Vec<(Duration, String)>,
    finish_after: Option<Duration>,
) -> String {
    let script = SseScript {
        steps,
        finish_after,
        headers_after: None,
    };
    start_sse_server(vec![script], Vec::new())
        .await
        .base_url
}

async fn serve(
    mut socket: TcpStream,
    seen: Arc<Mutex<Vec<String>>>,
    scripts: Arc<Mutex<Scripts>>,
    abandoned: Arc<AtomicUsize>,
) {
    // Read request headers.
    let mut buf = [0u8; 4096];
    let mut received = Vec::new();
    loop {
        let n = match socket.read(&mut buf).await {
            Ok(n) => n,
            Err(_) => return,
        };
        if n == 0 {
            return;
        }
        received.extend_from_slice(&buf[..n]);
        if received.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8_lossy(&received).to_string();
    let is_stream = request_path(&head).ends_with("/stream");
    seen.lock().expect("requests").push(head);

    if !is_stream {
        let body = {
            let mut scripts = scripts.lock().expect("scripts");
            match scripts.polls.pop_front() {
                Some(body) => {
                    scripts.last_poll = Some(body.clone());
                    Some(body)
                }
                None => scripts.last_poll.clone(),
            }
        };
        let response = match body {
            Some(body) => json_response(200, &body),
            None => json_response(500, r#"{"error":{"code":"NO_POLL","message":"no poll body"}}"#),
        };
        let _ = socket.write_all(response.as_bytes()).await;
        return;
    }

    let script = scripts.lock().expect("scripts").streams.pop_front();
    let Some(script) = script else {
        let response = json_response(
            404,
            r#"{"error":{"code":"NOT_FOUND","message":"streaming is not available"}}"#,
        );
        let _ = socket.write_all(response.as_bytes()).await;
        return;
    };

    if let Some(delay) = script.headers_after {
        tokio::time::sleep(delay).await;
    }

    let headers = concat!(
        "HTTP/1.1 200 OK\r\n",
        "Content-Type: text/event-stream\r\n",
        "Cache-Control: no-cache\r\n",
        "Connection: close\r\n",
        "Transfer-Encoding: chunked\r\n",
        "\r\n"
    );
    if socket.write_all(headers.as_bytes()).await.is_err() {
        return;
    }

    for (delay, frame) in script.steps {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let chunk = format!("{:X}\r\n{}\r\n", frame.len(), frame);
        if socket.write_all(chunk.as_bytes()).await.is_err() {
            abandoned.fetch_add(1, Ordering::SeqCst);
            return;
        }
    }

    if let Some(delay) = script.finish_after {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    let _ = socket.write_all(b"0\r\n\r\n").await;
}

fn json_response(status: u16, body: &str) -> String {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}
