use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::runtime::Handle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::download::{
    Defaults, ErrorHandler, Item, ItemStatus, Restart, SegmentId, SegmentRun, SegmentSnapshot,
    SegmentStatus, Terminal,
};
use crate::error::{SchedulerError, SegmentError};

/// Floor for the last chunk's duration when estimating throughput, so a chunk
/// that landed "instantly" does not produce an unbounded estimate.
const MIN_CHUNK_ELAPSED: Duration = Duration::from_millis(1);

static SCHEDULER_IDS: AtomicUsize = AtomicUsize::new(0);

/// A counter of running segment tasks with an upper bound.
///
/// One instance is typically shared by every scheduler in the process; each
/// scheduler also owns a private one for its own maximum.
#[derive(Debug)]
pub struct ParallelLimit {
    limit: usize,
    running: AtomicUsize,
}

impl ParallelLimit {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            running: AtomicUsize::new(0),
        })
    }

    /// The process-wide limit used when none is injected.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<ParallelLimit>> = OnceLock::new();
        SHARED
            .get_or_init(|| ParallelLimit::new(Defaults::PARALLEL_TASK_LIMIT))
            .clone()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    fn try_claim(&self) -> bool {
        self.running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running < self.limit).then_some(running + 1)
            })
            .is_ok()
    }

    fn claim(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                Some(running.saturating_sub(1))
            });
    }
}

/// Held by a running segment task; frees its slot on drop.
#[derive(Debug)]
pub struct ParallelPermit {
    global: Arc<ParallelLimit>,
    local: Arc<ParallelLimit>,
}

impl Drop for ParallelPermit {
    fn drop(&mut self) {
        self.local.release();
        self.global.release();
    }
}

/// The pair of limits a scheduler checks before launching work.
#[derive(Debug, Clone)]
pub struct ParallelBudget {
    global: Arc<ParallelLimit>,
    local: Arc<ParallelLimit>,
}

impl ParallelBudget {
    pub fn new(global: Arc<ParallelLimit>, instance_max: usize) -> Self {
        Self {
            global,
            local: ParallelLimit::new(instance_max),
        }
    }

    pub fn try_acquire(&self) -> Option<ParallelPermit> {
        if !self.local.try_claim() {
            return None;
        }
        if !self.global.try_claim() {
            self.local.release();
            return None;
        }
        Some(ParallelPermit {
            global: self.global.clone(),
            local: self.local.clone(),
        })
    }

    /// Claims a slot even when both limits are reached. Used to replace a task
    /// that is about to release its own slot.
    pub fn acquire_unchecked(&self) -> ParallelPermit {
        self.local.claim();
        self.global.claim();
        ParallelPermit {
            global: self.global.clone(),
            local: self.local.clone(),
        }
    }

    pub fn running(&self) -> usize {
        self.local.running()
    }

    pub fn effective_limit(&self) -> usize {
        self.local.limit().min(self.global.limit())
    }
}

/// Per-instance overrides. Anything left `None` uses [`Defaults`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub refresh_interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub max_parallels: Option<usize>,
}

impl SchedulerConfig {
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval.unwrap_or(Defaults::REFRESH_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Defaults::TIMEOUT)
    }

    pub fn max_parallels(&self) -> usize {
        self.max_parallels
            .unwrap_or(Defaults::PARALLEL_TASK_LIMIT)
            .max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub queued: usize,
    pub running: usize,
    pub limit: usize,
}

/// What one rebalancing pass decided for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebalance {
    Restart(SegmentId),
    Split {
        after: SegmentId,
        start: u64,
        end: u64,
    },
}

/// Picks at most one action for an item, scanning segments in range order.
///
/// A running segment whose current chunk has been in flight longer than
/// `timeout` is restarted. Otherwise, if its remaining bytes exceed what it is
/// expected to move within one `timeout` window at its last chunk's pace, its
/// unfinished range is split at the midpoint.
pub fn plan_rebalance(
    segments: &[SegmentSnapshot],
    timeout: Duration,
    allow_split: bool,
) -> Option<Rebalance> {
    for segment in segments
        .iter()
        .filter(|segment| segment.status == SegmentStatus::Running)
    {
        if segment
            .chunk_in_flight
            .is_some_and(|in_flight| in_flight > timeout)
        {
            return Some(Rebalance::Restart(segment.id));
        }
        if !allow_split {
            continue;
        }
        let (Some(end), Some(last_chunk)) = (segment.end, segment.last_chunk_elapsed) else {
            continue;
        };
        let remaining = segment.remaining().unwrap_or(0);
        if remaining < 2 * segment.chunk_size as u64 {
            continue;
        }
        if remaining <= reachable_within(segment.chunk_size, last_chunk, timeout) {
            continue;
        }
        return Some(Rebalance::Split {
            after: segment.id,
            start: segment.next + remaining / 2,
            end,
        });
    }
    None
}

fn reachable_within(chunk_size: usize, last_chunk: Duration, window: Duration) -> u64 {
    let per_chunk = last_chunk.max(MIN_CHUNK_ELAPSED).as_secs_f64();
    (chunk_size as f64 / per_chunk * window.as_secs_f64()) as u64
}

struct Shared {
    id: usize,
    queue: Mutex<VecDeque<Arc<Item>>>,
    config: SchedulerConfig,
    budget: ParallelBudget,
    client: Client,
    token: CancellationToken,
    started: AtomicBool,
}

/// Drives queued items to completion on a dedicated thread.
///
/// Dropping the scheduler cancels it, and with it every item it started.
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(client: Client, config: SchedulerConfig) -> Self {
        Self::with_parallel_limit(client, config, ParallelLimit::shared())
    }

    pub fn with_parallel_limit(
        client: Client,
        config: SchedulerConfig,
        global: Arc<ParallelLimit>,
    ) -> Self {
        let budget = ParallelBudget::new(global, config.max_parallels());
        Self {
            shared: Arc::new(Shared {
                id: SCHEDULER_IDS.fetch_add(1, Ordering::Relaxed),
                queue: Mutex::new(VecDeque::new()),
                config,
                budget,
                client,
                token: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn add_item(&self, item: Arc<Item>) {
        debug!(
            "scheduler {} queued {} -> {:?}",
            self.shared.id,
            item.source(),
            item.target()
        );
        self.shared.queue.lock().push_back(item);
    }

    /// Spawns the polling thread. Must be called from within a Tokio runtime;
    /// segment transfers run as tasks on that runtime. `parent` cancels the
    /// scheduler the same way [`Scheduler::cancel`] does.
    pub fn start(&self, parent: &CancellationToken) -> Result<(), SchedulerError> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyStarted);
        }
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.shared.started.store(false, Ordering::Release);
                return Err(SchedulerError::NoRuntime);
            }
        };

        let shared = self.shared.clone();
        let parent = parent.clone();
        let thread = thread::Builder::new()
            .name(format!("kfetch-scheduler-{}", self.shared.id))
            .spawn(move || handle.block_on(shared.run(parent)))
            .map_err(SchedulerError::Spawn)?;
        *self.thread.lock() = Some(thread);
        Ok(())
    }

    /// Cancels the scheduler and every item it has started.
    pub fn cancel(&self) {
        self.shared.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Cancels and waits for the polling thread to exit.
    pub async fn shutdown(&self) {
        self.cancel();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            queued: self.shared.queue.lock().len(),
            running: self.shared.budget.running(),
            limit: self.shared.budget.effective_limit(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

impl Shared {
    async fn run(self: Arc<Self>, parent: CancellationToken) {
        let refresh = self.config.refresh_interval();
        info!(
            "scheduler {} running: {} parallel, refresh {:?}, timeout {:?}",
            self.id,
            self.budget.effective_limit(),
            refresh,
            self.config.timeout()
        );
        let on_error = failure_handler();

        loop {
            if parent.is_cancelled() {
                self.token.cancel();
            }
            if self.token.is_cancelled() {
                break;
            }

            self.tick(&on_error);

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = parent.cancelled() => {
                    self.token.cancel();
                    break;
                }
                _ = sleep(refresh) => {}
            }
        }
        info!("scheduler {} stopped", self.id);
    }

    fn tick(&self, on_error: &ErrorHandler) {
        let pending: Vec<Arc<Item>> = self.queue.lock().drain(..).collect();
        let mut tracked = Vec::with_capacity(pending.len());

        for item in pending {
            match item.status() {
                status if status.is_terminal() => {
                    debug!("scheduler {} dropping {} ({status})", self.id, item.source());
                    continue;
                }
                ItemStatus::Waiting => self.begin(&item, on_error),
                _ => self.rebalance(&item, on_error),
            }
            tracked.push(item);
        }

        let mut queue = self.queue.lock();
        for item in tracked.into_iter().rev() {
            queue.push_front(item);
        }
    }

    fn begin(&self, item: &Arc<Item>, on_error: &ErrorHandler) {
        let Some(permit) = self.budget.try_acquire() else {
            return;
        };
        item.bind(self.client.clone(), &self.token);
        if let Some(run) = item.new_segment(0, None, Some(on_error.clone()), None) {
            spawn_segment(permit, run);
        }
    }

    fn rebalance(&self, item: &Arc<Item>, on_error: &ErrorHandler) {
        let segments = item.segments();
        let timeout = self.config.timeout();
        let Some(action) = plan_rebalance(&segments, timeout, item.try_segment()) else {
            return;
        };

        match action {
            Rebalance::Restart(id) => {
                warn!(
                    "{}: segment {id} made no progress for {:?}; restarting",
                    item.source(),
                    timeout
                );
                if let Restart::Replaced(run) = item.restart_segment(id, true) {
                    spawn_segment(self.budget.acquire_unchecked(), run);
                }
            }
            Rebalance::Split { after, start, end } => {
                let Some(permit) = self.budget.try_acquire() else {
                    return;
                };
                match item.new_segment(start, Some(end), Some(on_error.clone()), Some(after)) {
                    Some(run) => {
                        debug!("{}: split {after} at {start} (end {end})", item.source());
                        spawn_segment(permit, run);
                    }
                    None => debug!("{}: split of {after} at {start} rejected", item.source()),
                }
            }
        }
    }
}

fn spawn_segment(permit: ParallelPermit, run: SegmentRun) {
    tokio::spawn(async move {
        let _permit = permit;
        run.await
    });
}

/// One unrecoverable segment fails the whole item. A refused range request is
/// reported but the item deals with it itself.
fn failure_handler() -> ErrorHandler {
    Arc::new(
        |item: &Arc<Item>, terminal: Terminal, err: Option<Arc<SegmentError>>| {
            if terminal == Terminal::RangeUnsupported {
                warn!(
                    "{}: server ignored a range request; splitting disabled",
                    item.source()
                );
                return;
            }
            let reason = err
                .map(|err| err.to_string())
                .unwrap_or_else(|| terminal.to_string());
            error!("{}: segment {terminal}: {reason}", item.source());
            item.cancel(true);
        },
    )
}
