use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use reqwest::{header, Client, StatusCode, Url};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::download::file::{open_shared, write_all_at};
use crate::download::range::{
    parse_content_length, parse_content_range, range_header, refuses_ranges,
};
use crate::download::status::{SegmentStatus, Terminal};
use crate::download::Defaults;
use crate::error::SegmentError;

/// Stable handle for a segment inside its item. Never reused within one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Invoked exactly once when a started segment's run loop exits.
pub type EndCallback = Arc<dyn Fn(&Arc<Segment>) + Send + Sync>;

type StatusCallback = Box<dyn FnOnce(&Segment) + Send>;

#[derive(Debug, Clone)]
pub struct SegmentSpec {
    pub source: Url,
    pub target: PathBuf,
    pub start: u64,
    /// Inclusive. `None` until the server tells us.
    pub end: Option<u64>,
    pub chunk_size: usize,
    pub retry_count: u32,
    /// Send a `Range` header. Without it the transfer always starts at offset 0.
    pub enable_range: bool,
}

/// What the server told us about the resource, captured before `Running`.
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub resolved: Option<Url>,
    pub content_length: Option<u64>,
    pub refuses_ranges: bool,
}

/// Point-in-time view used by the scheduler and progress queries.
#[derive(Debug, Clone)]
pub struct SegmentSnapshot {
    pub id: SegmentId,
    pub status: SegmentStatus,
    pub start: u64,
    pub next: u64,
    pub end: Option<u64>,
    pub chunk_size: usize,
    pub chunk_in_flight: Option<Duration>,
    pub last_chunk_elapsed: Option<Duration>,
    pub retries_left: u32,
}

impl SegmentSnapshot {
    pub fn transferred(&self) -> u64 {
        self.next.saturating_sub(self.start)
    }

    pub fn remaining(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_add(1).saturating_sub(self.next))
    }
}

struct RangeState {
    next: u64,
    end: Option<u64>,
    /// Set when the segment is superseded by a restart; no further commits.
    sealed: bool,
}

#[derive(Default)]
struct ChunkClock {
    started_at: Option<Instant>,
    last_elapsed: Option<Duration>,
}

struct Waiter {
    target: SegmentStatus,
    callback: StatusCallback,
}

enum Interrupt {
    Cancelled,
    RangeUnsupported,
    Error(SegmentError),
}

impl From<SegmentError> for Interrupt {
    fn from(err: SegmentError) -> Self {
        Interrupt::Error(err)
    }
}

impl From<std::io::Error> for Interrupt {
    fn from(err: std::io::Error) -> Self {
        Interrupt::Error(err.into())
    }
}

impl From<reqwest::Error> for Interrupt {
    fn from(err: reqwest::Error) -> Self {
        Interrupt::Error(err.into())
    }
}

/// One contiguous byte range of one file, fetched over a single HTTP stream at a time.
pub struct Segment {
    id: SegmentId,
    source: Url,
    target: PathBuf,
    start: u64,
    chunk_size: usize,
    enable_range: bool,
    range: Mutex<RangeState>,
    clock: Mutex<ChunkClock>,
    response: Mutex<ResponseInfo>,
    retries_left: AtomicU32,
    attempts: AtomicU32,
    last_error: Mutex<Option<Arc<SegmentError>>>,
    status_tx: watch::Sender<SegmentStatus>,
    waiters: Mutex<Vec<Waiter>>,
    started: AtomicBool,
    token: CancellationToken,
    on_end: Option<EndCallback>,
}

impl Segment {
    pub fn new(
        id: SegmentId,
        spec: SegmentSpec,
        token: CancellationToken,
        on_end: Option<EndCallback>,
    ) -> Arc<Self> {
        // An unranged request can only ever deliver the body from the first byte.
        let start = if spec.enable_range { spec.start } else { 0 };
        let (status_tx, _) = watch::channel(SegmentStatus::WaitingStart);
        Arc::new(Self {
            id,
            source: spec.source,
            target: spec.target,
            start,
            chunk_size: spec.chunk_size.max(1),
            enable_range: spec.enable_range,
            range: Mutex::new(RangeState {
                next: start,
                end: spec.end,
                sealed: false,
            }),
            clock: Mutex::new(ChunkClock::default()),
            response: Mutex::new(ResponseInfo::default()),
            retries_left: AtomicU32::new(spec.retry_count.max(1)),
            attempts: AtomicU32::new(0),
            last_error: Mutex::new(None),
            status_tx,
            waiters: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            token,
            on_end,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn source(&self) -> &Url {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn range_enabled(&self) -> bool {
        self.enable_range
    }

    pub fn start_position(&self) -> u64 {
        self.start
    }

    pub fn next_position(&self) -> u64 {
        self.range.lock().next
    }

    pub fn end_position(&self) -> Option<u64> {
        self.range.lock().end
    }

    pub fn transferred(&self) -> u64 {
        self.next_position().saturating_sub(self.start)
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left.load(Ordering::Acquire)
    }

    /// Number of request attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<Arc<SegmentError>> {
        self.last_error.lock().clone()
    }

    pub fn response_info(&self) -> ResponseInfo {
        self.response.lock().clone()
    }

    pub fn resolved_uri(&self) -> Option<Url> {
        self.response.lock().resolved.clone()
    }

    pub fn status(&self) -> SegmentStatus {
        *self.status_tx.borrow()
    }

    /// Receiver that observes every status transition.
    pub fn status_changed(&self) -> watch::Receiver<SegmentStatus> {
        self.status_tx.subscribe()
    }

    /// Runs `callback` once the segment reaches `target`.
    ///
    /// Fires immediately if the segment is already at `target`. Returns `false`
    /// (and drops the callback) if the segment has already moved past it.
    pub fn when<F>(&self, target: SegmentStatus, callback: F) -> bool
    where
        F: FnOnce(&Segment) + Send + 'static,
    {
        let mut waiters = self.waiters.lock();
        let current = self.status();
        if current == target {
            drop(waiters);
            callback(self);
            return true;
        }
        if current.is_past(target) {
            return false;
        }
        waiters.push(Waiter {
            target,
            callback: Box::new(callback),
        });
        true
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn snapshot(&self) -> SegmentSnapshot {
        let (next, end) = {
            let range = self.range.lock();
            (range.next, range.end)
        };
        let (chunk_in_flight, last_chunk_elapsed) = {
            let clock = self.clock.lock();
            (clock.started_at.map(|at| at.elapsed()), clock.last_elapsed)
        };
        SegmentSnapshot {
            id: self.id,
            status: self.status(),
            start: self.start,
            next,
            end,
            chunk_size: self.chunk_size,
            chunk_in_flight,
            last_chunk_elapsed,
            retries_left: self.retries_left(),
        }
    }

    /// Executes the transfer until it reaches a terminal status.
    ///
    /// The end callback runs exactly once, after the terminal status is set. A
    /// second call does not start another transfer; it waits for the first one.
    pub async fn start(self: Arc<Self>, client: Client) -> Terminal {
        if self.started.swap(true, Ordering::AcqRel) {
            let mut rx = self.status_changed();
            let terminal = match rx.wait_for(|status| status.is_terminal()).await {
                Ok(status) => status.terminal().unwrap_or(Terminal::Cancelled),
                Err(_) => Terminal::Cancelled,
            };
            return terminal;
        }

        let terminal = self.run(&client).await;
        self.set_status(SegmentStatus::Finished(terminal));
        debug!(
            "segment {} finished: {terminal} ({} bytes from offset {})",
            self.id,
            self.transferred(),
            self.start
        );
        if let Some(on_end) = &self.on_end {
            on_end(&self);
        }
        terminal
    }

    async fn run(&self, client: &Client) -> Terminal {
        let mut last_status: Option<u16> = None;
        loop {
            if self.token.is_cancelled() {
                return Terminal::Cancelled;
            }
            self.attempts.fetch_add(1, Ordering::AcqRel);

            let err = match self.attempt(client, &mut last_status).await {
                Ok(()) => return Terminal::Success,
                Err(Interrupt::Cancelled) => return Terminal::Cancelled,
                Err(Interrupt::RangeUnsupported) => return Terminal::RangeUnsupported,
                Err(Interrupt::Error(err)) => err,
            };
            if self.token.is_cancelled() {
                return Terminal::Cancelled;
            }

            let left = self.consume_retry();
            warn!(
                "segment {} attempt {} failed: {err}; {left} retries left",
                self.id,
                self.attempts()
            );
            *self.last_error.lock() = Some(Arc::new(err));
            if left == 0 {
                return Terminal::Failed(last_status);
            }
            self.back_off();

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Terminal::Cancelled,
                _ = sleep(Defaults::RETRY_BACKOFF) => {}
            }
        }
    }

    async fn attempt(&self, client: &Client, last_status: &mut Option<u16>) -> Result<(), Interrupt> {
        let file = open_shared(&self.target)?;
        let (from, end) = {
            let range = self.range.lock();
            (range.next, range.end)
        };
        if end.is_some_and(|end| from > end) {
            return Ok(());
        }

        // A retry after partial progress resumes where the last attempt stopped.
        let ranged = self.enable_range || from > self.start;
        let mut request = client.get(self.source.clone());
        if ranged {
            request = request.header(header::RANGE, range_header(from, end));
        }

        self.set_status(SegmentStatus::WaitingServer);
        let response = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(Interrupt::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        *last_status = Some(status.as_u16());
        if !status.is_success() {
            return Err(SegmentError::Status(status).into());
        }

        let headers = response.headers();
        let body_length = parse_content_length(headers.get(header::CONTENT_LENGTH));
        let content_range = parse_content_range(headers.get(header::CONTENT_RANGE));
        let refuses = refuses_ranges(headers.get(header::ACCEPT_RANGES));

        let total = if !ranged {
            self.adopt_length(body_length);
            body_length
        } else if status == StatusCode::PARTIAL_CONTENT {
            let content_range = content_range
                .filter(|range| range.start == from)
                .ok_or(Interrupt::RangeUnsupported)?;
            let mut range = self.range.lock();
            if range.end.is_none() {
                range.end = Some(content_range.end);
            }
            content_range.total
        } else if self.start == 0 && !self.enable_range {
            debug!(
                "segment {} resume from {from} ignored by server; restarting at 0",
                self.id
            );
            self.range.lock().next = 0;
            self.adopt_length(body_length);
            body_length
        } else {
            return Err(Interrupt::RangeUnsupported);
        };

        {
            let mut info = self.response.lock();
            info.resolved = Some(response.url().clone());
            if total.is_some() {
                info.content_length = total;
            }
            info.refuses_ranges = refuses;
        }

        let from = self.range.lock().next;
        self.clock.lock().started_at = Some(Instant::now());
        self.set_status(SegmentStatus::Running);

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::with_capacity(self.chunk_size);
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(Interrupt::Cancelled),
                next = stream.next() => next,
            };
            let Some(bytes) = next else {
                break;
            };
            let bytes = bytes?;
            let mut rest: &[u8] = &bytes;
            while !rest.is_empty() {
                let take = (self.chunk_size - buffer.len()).min(rest.len());
                buffer.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                if buffer.len() == self.chunk_size {
                    let done = self.commit(&file, &buffer)?;
                    buffer.clear();
                    if done {
                        file.sync_data()?;
                        return Ok(());
                    }
                }
            }
        }

        if !buffer.is_empty() && self.commit(&file, &buffer)? {
            file.sync_data()?;
            return Ok(());
        }

        let (next, end) = {
            let range = self.range.lock();
            (range.next, range.end)
        };
        if let Some(end) = end {
            if next <= end {
                return Err(SegmentError::LengthMismatch {
                    expected: end.saturating_add(1) - from,
                    actual: next - from,
                }
                .into());
            }
        }
        file.sync_data()?;
        Ok(())
    }

    fn adopt_length(&self, body_length: Option<u64>) {
        let mut range = self.range.lock();
        if range.end.is_none() {
            range.end = body_length.and_then(|len| len.checked_sub(1));
        }
    }

    /// Writes one chunk at `next`, clipped to the current end. Returns true once
    /// the range is complete. Holding the range lock across the write is what
    /// keeps a concurrent split from handing these bytes to a sibling.
    fn commit(&self, file: &File, chunk: &[u8]) -> Result<bool, Interrupt> {
        let mut range = self.range.lock();
        if range.sealed {
            return Err(Interrupt::Cancelled);
        }
        let take = match range.end {
            Some(end) => end
                .saturating_add(1)
                .saturating_sub(range.next)
                .min(chunk.len() as u64) as usize,
            None => chunk.len(),
        };
        if take > 0 {
            write_all_at(file, &chunk[..take], range.next)?;
            range.next += take as u64;
        }
        let done = range.end.is_some_and(|end| range.next > end);
        drop(range);

        let now = Instant::now();
        let mut clock = self.clock.lock();
        let began = clock.started_at.replace(now);
        clock.last_elapsed = began.map(|at| now.duration_since(at));
        Ok(done)
    }

    /// Leaves `Running` while waiting to retry, so the backoff is not taken for a
    /// stalled chunk.
    fn back_off(&self) {
        self.clock.lock().started_at = None;
        self.set_status(SegmentStatus::WaitingServer);
    }

    fn consume_retry(&self) -> u32 {
        let previous = self
            .retries_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                Some(left.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn set_status(&self, next: SegmentStatus) -> bool {
        let ready = {
            let mut waiters = self.waiters.lock();
            let moved = self.status_tx.send_if_modified(|current| {
                if *current != next && current.can_enter(next) {
                    *current = next;
                    true
                } else {
                    false
                }
            });
            if !moved {
                return false;
            }
            let (ready, pending): (Vec<_>, Vec<_>) =
                waiters.drain(..).partition(|waiter| waiter.target == next);
            waiters.extend(pending.into_iter().filter(|w| !next.is_past(w.target)));
            ready
        };
        debug!("segment {} -> {next}", self.id);
        for waiter in ready {
            (waiter.callback)(self);
        }
        true
    }

    /// Moves the end to `split_start - 1` if the split point is still ahead of
    /// the write cursor. Only a running segment with a known end can be split.
    pub(crate) fn shrink_for_split(&self, split_start: u64) -> Option<u64> {
        let mut range = self.range.lock();
        if range.sealed || self.status() != SegmentStatus::Running {
            return None;
        }
        match range.end {
            Some(end) if range.next < split_start && split_start <= end => {
                range.end = Some(split_start - 1);
                Some(end)
            }
            _ => None,
        }
    }

    /// Cancels and freezes the segment so a replacement can own its range.
    pub(crate) fn seal(&self) -> Option<u64> {
        self.token.cancel();
        let mut range = self.range.lock();
        range.sealed = true;
        range.end
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let range = self.range.lock();
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("start", &self.start)
            .field("next", &range.next)
            .field("end", &range.end)
            .finish()
    }
}
