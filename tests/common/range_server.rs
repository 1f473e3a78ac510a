//! Minimal HTTP/1.1 server for integration tests.
//!
//! Serves a single static body over GET, honouring `Range: bytes=a-b` with
//! 206 Partial Content unless told to ignore ranges. Writes can be throttled,
//! and the first connection can be made to stall or close partway through.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Send `Accept-Ranges: none` on every response.
    pub advertise_none: bool,
    /// Bytes written per burst.
    pub burst: usize,
    /// Pause after each burst.
    pub delay: Duration,
    /// Make the first connection go silent after this many body bytes.
    pub stall_first_after: Option<usize>,
    /// Close the first connection after this many body bytes, short of its
    /// advertised length.
    pub truncate_first_after: Option<usize>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            advertise_none: false,
            burst: 64 * 1024,
            delay: Duration::ZERO,
            stall_first_after: None,
            truncate_first_after: None,
        }
    }
}

impl RangeServerOptions {
    pub fn throttled(burst: usize, delay: Duration) -> Self {
        Self {
            burst,
            delay,
            ..Self::default()
        }
    }
}

/// Handle to a running server. The server lives until the process exits.
#[derive(Debug, Clone)]
pub struct RangeServer {
    pub url: String,
    requests: Arc<AtomicUsize>,
}

impl RangeServer {
    /// Number of GET requests received so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let body = Arc::new(body);
    let requests = Arc::new(AtomicUsize::new(0));
    let first = Arc::new(AtomicBool::new(true));
    let counter = requests.clone();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let counter = counter.clone();
            let is_first = first.swap(false, Ordering::SeqCst);
            thread::spawn(move || handle(stream, &body, opts, is_first, &counter));
        }
    });
    RangeServer {
        url: format!("http://127.0.0.1:{}/payload.bin", port),
        requests,
    }
}

/// A URL on a port nothing listens on.
pub fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("http://127.0.0.1:{}/missing.bin", port)
}

/// Deterministic, non-repeating-per-chunk payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

fn handle(
    mut stream: TcpStream,
    body: &[u8],
    opts: RangeServerOptions,
    is_first: bool,
    requests: &AtomicUsize,
) {
    let stall = opts.stall_first_after.filter(|_| is_first);
    let truncate = opts.truncate_first_after.filter(|_| is_first);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
        return;
    }
    requests.fetch_add(1, Ordering::SeqCst);

    let total = body.len() as u64;
    let accept_ranges = if opts.advertise_none {
        "Accept-Ranges: none\r\n"
    } else if opts.support_ranges {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    };

    let (status, content_range, slice) = match range.filter(|_| opts.support_ranges) {
        Some((start, end_incl)) => {
            let end_incl = end_incl.min(total.saturating_sub(1));
            if total == 0 || start > end_incl {
                (
                    "416 Range Not Satisfiable",
                    Some(format!("bytes */{}", total)),
                    &body[0..0],
                )
            } else {
                let slice = &body[start as usize..=end_incl as usize];
                (
                    "206 Partial Content",
                    Some(format!("bytes {}-{}/{}", start, end_incl, total)),
                    slice,
                )
            }
        }
        None => ("200 OK", None, body),
    };

    let content_range = content_range
        .map(|value| format!("Content-Range: {}\r\n", value))
        .unwrap_or_default();
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
        status,
        slice.len(),
        content_range,
        accept_ranges
    );
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    let slice = match truncate {
        Some(limit) => &slice[..limit.min(slice.len())],
        None => slice,
    };
    let mut sent = 0usize;
    for burst in slice.chunks(opts.burst.max(1)) {
        if let Some(limit) = stall {
            if sent >= limit {
                thread::sleep(Duration::from_secs(30));
                return;
            }
        }
        if stream.write_all(burst).is_err() {
            return;
        }
        let _ = stream.flush();
        sent += burst.len();
        if !opts.delay.is_zero() {
            thread::sleep(opts.delay);
        }
    }
}

/// Returns (method, optional (start, end_inclusive) for Range: bytes=X-Y).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if value.to_lowercase().starts_with("bytes=") {
                    let part = value[6..].trim();
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
