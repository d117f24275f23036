//! A minimal HTTP/1.1 server that streams a fixed body slowly and honours
//! `Range` requests, for pause/resume/cancel/shutdown/stall scenarios
//! wiremock cannot express.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Streaming behaviour.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Bytes per write.
    pub chunk: usize,
    /// Pause after each write.
    pub delay: Duration,
    /// When false, every request gets a full `200` response.
    pub honor_ranges: bool,
    /// The first response goes silent after this many body bytes, holding
    /// the connection open.
    pub stall_first_after: Option<usize>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            chunk: 1024,
            delay: Duration::from_millis(5),
            honor_ranges: true,
            stall_first_after: None,
        }
    }
}

/// A running server. Dropping it stops accepting connections.
pub struct RangeServer {
    addr: std::net::SocketAddr,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
    accept: JoinHandle<()>,
}

impl RangeServer {
    pub async fn start(body: Vec<u8>, options: ServeOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let body = Arc::new(body);
        let stalled = Arc::new(AtomicBool::new(false));

        let log = Arc::clone(&ranges);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let body = Arc::clone(&body);
                let log = Arc::clone(&log);
                let options = options.clone();
                let stall_at = options
                    .stall_first_after
                    .filter(|_| !stalled.swap(true, Ordering::SeqCst));
                tokio::spawn(async move {
                    let _ = serve(stream, &body, &options, stall_at, &log).await;
                });
            }
        });

        Self {
            addr,
            ranges,
            accept,
        }
    }

    /// URL of `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// `Range` header of every request received so far, in order.
    pub fn range_headers(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.ranges.lock().unwrap().len()
    }
}

impl Drop for RangeServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let bounds = value.trim().strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = if end.trim().is_empty() {
        len.saturating_sub(1)
    } else {
        end.trim().parse::<u64>().ok()?.min(len.saturating_sub(1))
    };
    Some((start, end))
}

async fn serve(
    stream: TcpStream,
    body: &[u8],
    options: &ServeOptions,
    stall_at: Option<usize>,
    log: &Mutex<Vec<Option<String>>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("range")
        {
            range = Some(value.trim().to_string());
        }
    }
    log.lock().unwrap().push(range.clone());

    let mut stream = reader.into_inner();
    let len = body.len() as u64;
    let requested = range
        .as_deref()
        .filter(|_| options.honor_ranges)
        .map(|value| parse_range(value, len));

    let (head, slice) = match requested {
        Some(Some((start, _))) if start >= len => {
            let head = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{len}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            (head, &body[..0])
        }
        Some(Some((start, end))) => {
            let slice = &body[start as usize..=end as usize];
            let head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes {start}-{end}/{len}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                slice.len()
            );
            (head, slice)
        }
        _ => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {len}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n"
            );
            (head, body)
        }
    };

    stream.write_all(head.as_bytes()).await?;
    if let Some(at) = stall_at {
        stream.write_all(&slice[..at.min(slice.len())]).await?;
        stream.flush().await?;
        // Keep the connection open without sending another byte.
        std::future::pending::<()>().await;
        return Ok(());
    }
    for chunk in slice.chunks(options.chunk.max(1)) {
        stream.write_all(chunk).await?;
        stream.flush().await?;
        if !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }
    }
    stream.shutdown().await
}
