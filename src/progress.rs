use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::download::{Item, ItemStatus};
use crate::scheduler::Scheduler;
use crate::util::format_bytes;

const PROGRESS_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Quiet,
    Text,
    Json,
}

#[derive(Debug, Clone, Copy)]
pub enum ProgressFinish {
    Success,
    Failure,
}

/// Periodically renders aggregate progress for a set of items.
pub struct ProgressReporter {
    stop_tx: Option<oneshot::Sender<ProgressFinish>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(
        mode: ProgressMode,
        items: Vec<Arc<Item>>,
        scheduler: Arc<Scheduler>,
    ) -> Option<Self> {
        let renderer: Box<dyn Renderer> = match mode {
            ProgressMode::Quiet => return None,
            ProgressMode::Text => Box::new(TextRenderer::new()),
            ProgressMode::Json => Box::new(JsonRenderer),
        };
        Some(Self::spawn_with(renderer, items, scheduler))
    }

    pub async fn finish(mut self, finish: ProgressFinish) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(finish);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    fn spawn_with(
        mut renderer: Box<dyn Renderer>,
        items: Vec<Arc<Item>>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(PROGRESS_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let start = Instant::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = ProgressSnapshot::collect(&items, &scheduler, start);
                        renderer.render(&snapshot, None);
                    }
                    result = &mut stop_rx => {
                        let finish = result.unwrap_or(ProgressFinish::Failure);
                        let snapshot = ProgressSnapshot::collect(&items, &scheduler, start);
                        renderer.render(&snapshot, Some(finish));
                        break;
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone)]
struct ProgressSnapshot {
    downloaded: u64,
    total: Option<u64>,
    elapsed: Duration,
    items_done: usize,
    items_total: usize,
    segments_running: usize,
    segments_limit: usize,
}

impl ProgressSnapshot {
    fn collect(items: &[Arc<Item>], scheduler: &Scheduler, start: Instant) -> Self {
        let downloaded = items
            .iter()
            .map(|item| item.calculate_transferred_length())
            .sum();
        let total = items
            .iter()
            .map(|item| item.content_length())
            .sum::<Option<u64>>();
        let items_done = items
            .iter()
            .filter(|item| item.status() == ItemStatus::Success)
            .count();
        let scheduler = scheduler.snapshot();
        Self {
            downloaded,
            total,
            elapsed: start.elapsed(),
            items_done,
            items_total: items.len(),
            segments_running: scheduler.running,
            segments_limit: scheduler.limit,
        }
    }

    fn percent(&self) -> Option<f64> {
        let total = self.total?;
        if total == 0 {
            return Some(100.0);
        }
        Some((self.downloaded as f64 / total as f64 * 100.0).min(100.0))
    }

    fn throughput(&self) -> f64 {
        let elapsed = self.elapsed.as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        self.downloaded as f64 / elapsed
    }
}

trait Renderer: Send {
    fn render(&mut self, snapshot: &ProgressSnapshot, finish: Option<ProgressFinish>);
}

struct TextRenderer {
    is_tty: bool,
    last_line_len: usize,
    last_log: Option<Instant>,
    last_line: Option<String>,
}

impl TextRenderer {
    fn new() -> Self {
        Self {
            is_tty: std::io::stderr().is_terminal(),
            last_line_len: 0,
            last_log: None,
            last_line: None,
        }
    }
}

fn text_line(snapshot: &ProgressSnapshot) -> String {
    let mut parts = Vec::new();
    match snapshot.total {
        Some(total) => parts.push(format!(
            "{} / {}",
            format_bytes(snapshot.downloaded),
            format_bytes(total)
        )),
        None => parts.push(format!("{} downloaded", format_bytes(snapshot.downloaded))),
    }
    if let Some(percent) = snapshot.percent() {
        parts.push(format!("{percent:5.1}%"));
    }
    let throughput = snapshot.throughput();
    if throughput > 0.0 {
        parts.push(format!("{}/s", format_bytes(throughput.round() as u64)));
    }
    if snapshot.items_total > 1 {
        parts.push(format!("files:{}/{}", snapshot.items_done, snapshot.items_total));
    }
    parts.push(format!(
        "segments:{}/{}",
        snapshot.segments_running, snapshot.segments_limit
    ));
    parts.join(" | ")
}

impl Renderer for TextRenderer {
    fn render(&mut self, snapshot: &ProgressSnapshot, finish: Option<ProgressFinish>) {
        let line = text_line(snapshot);
        if self.is_tty {
            let mut to_print = line.clone();
            if self.last_line_len > line.len() {
                to_print.push_str(&" ".repeat(self.last_line_len - line.len()));
            }
            eprint!("\r{}", to_print);
            let _ = std::io::stderr().flush();
            self.last_line_len = line.len();
            if finish.is_some() {
                eprintln!();
            }
            return;
        }

        let now = Instant::now();
        let is_new_line = self.last_line.as_ref() != Some(&line);
        let should_emit = finish.is_some()
            || is_new_line
            || self
                .last_log
                .map_or(true, |prev| now.duration_since(prev) >= Duration::from_secs(1));
        if should_emit {
            eprintln!("{}", line);
            self.last_log = Some(now);
            self.last_line = Some(line);
        }
    }
}

struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn render(&mut self, snapshot: &ProgressSnapshot, finish: Option<ProgressFinish>) {
        let event = match finish {
            None => "progress",
            Some(ProgressFinish::Success) => "complete",
            Some(ProgressFinish::Failure) => "failed",
        };
        if let Ok(serialized) = serde_json::to_string(&JsonProgressEvent::new(event, snapshot)) {
            println!("{}", serialized);
            let _ = std::io::stdout().flush();
        }
    }
}

#[derive(Serialize)]
struct JsonProgressEvent {
    event: &'static str,
    timestamp_ms: u128,
    elapsed_ms: u128,
    bytes_downloaded: u64,
    total_bytes: Option<u64>,
    fraction: Option<f64>,
    bytes_per_second: f64,
    files_done: usize,
    files_total: usize,
    running_segments: usize,
    segment_limit: usize,
}

impl JsonProgressEvent {
    fn new(event: &'static str, snapshot: &ProgressSnapshot) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            event,
            timestamp_ms: now,
            elapsed_ms: snapshot.elapsed.as_millis(),
            bytes_downloaded: snapshot.downloaded,
            total_bytes: snapshot.total,
            fraction: snapshot.percent().map(|p| p / 100.0),
            bytes_per_second: snapshot.throughput(),
            files_done: snapshot.items_done,
            files_total: snapshot.items_total,
            running_segments: snapshot.segments_running,
            segment_limit: snapshot.segments_limit,
        }
    }
}
