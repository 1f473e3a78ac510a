use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use reqwest::{Client, Url};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::download::file::{preallocate, prepare_target};
use crate::download::segment::{EndCallback, Segment, SegmentId, SegmentSnapshot, SegmentSpec};
use crate::download::status::{ItemStatus, SegmentStatus, Terminal};
use crate::download::Defaults;
use crate::error::SegmentError;
use crate::util::format_bytes;

/// Called when a segment ends in anything other than success or cancellation.
pub type ErrorHandler =
    Arc<dyn Fn(&Arc<Item>, Terminal, Option<Arc<SegmentError>>) + Send + Sync>;

/// A segment's transfer, ready to be spawned. Resolves to its terminal status.
pub type SegmentRun = BoxFuture<'static, Terminal>;

type FinishedCallback = Box<dyn FnOnce(&Item) + Send>;

/// Outcome of [`Item::restart_segment`].
pub enum Restart {
    /// The old segment was cancelled and replaced; spawn this to run the new one.
    Replaced(SegmentRun),
    /// The retry budget ran out; the item has been failed instead.
    Exhausted,
    /// Nothing to restart: unknown id, already terminal, or the item is not bound.
    Skipped,
}

struct Binding {
    client: Client,
    token: CancellationToken,
}

struct Slot {
    segment: Arc<Segment>,
    on_end: EndCallback,
    on_error: Option<ErrorHandler>,
}

#[derive(Default)]
struct SegmentList {
    slots: Vec<Slot>,
}

impl SegmentList {
    fn position(&self, id: SegmentId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.segment.id() == id)
    }

    fn all_terminal(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.segment.status().is_terminal())
    }

    fn all_succeeded(&self) -> bool {
        !self.slots.is_empty()
            && self.slots.iter().all(|slot| {
                slot.segment.status() == SegmentStatus::Finished(Terminal::Success)
            })
    }

    /// Every segment has ended, but not all of them with success.
    fn settled_short(&self) -> bool {
        !self.slots.is_empty() && self.all_terminal() && !self.all_succeeded()
    }
}

/// One file download, made of segments whose ranges partition the file.
///
/// All mutations of the segment list go through `new_segment` and
/// `restart_segment`, and every aggregate read takes the same lock.
pub struct Item {
    source: Url,
    target: PathBuf,
    chunk_size: usize,
    retry_count: u32,
    resolved: Mutex<Option<Url>>,
    content_length: Mutex<Option<u64>>,
    try_segment: AtomicBool,
    list: Mutex<SegmentList>,
    next_id: AtomicU64,
    status_tx: watch::Sender<ItemStatus>,
    binding: OnceLock<Binding>,
    finished: Mutex<Vec<FinishedCallback>>,
}

impl Item {
    pub fn new(source: Url, target: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_options(source, target, Defaults::CHUNK_SIZE, Defaults::RETRY_COUNT)
    }

    pub fn with_options(
        source: Url,
        target: impl Into<PathBuf>,
        chunk_size: usize,
        retry_count: u32,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ItemStatus::Waiting);
        Arc::new(Self {
            source,
            target: target.into(),
            chunk_size: chunk_size.max(1),
            retry_count: retry_count.max(1),
            resolved: Mutex::new(None),
            content_length: Mutex::new(None),
            try_segment: AtomicBool::new(true),
            list: Mutex::new(SegmentList::default()),
            next_id: AtomicU64::new(0),
            status_tx,
            binding: OnceLock::new(),
            finished: Mutex::new(Vec::new()),
        })
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

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Final URI after redirects, known once the first segment is running.
    pub fn resolved_uri(&self) -> Option<Url> {
        self.resolved.lock().clone()
    }

    pub fn content_length(&self) -> Option<u64> {
        *self.content_length.lock()
    }

    /// False once the server has shown it will not honour range requests.
    pub fn try_segment(&self) -> bool {
        self.try_segment.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ItemStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ItemStatus> {
        self.status_tx.subscribe()
    }

    /// Resolves once the item reaches a terminal status.
    pub async fn wait(&self) -> ItemStatus {
        let mut rx = self.status_tx.subscribe();
        let status = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// Registers a callback for successful completion. Fires at most once; runs
    /// immediately if the item already succeeded.
    pub fn on_finished<F>(&self, callback: F)
    where
        F: FnOnce(&Item) + Send + 'static,
    {
        let mut finished = self.finished.lock();
        if self.status() == ItemStatus::Success {
            drop(finished);
            callback(self);
            return;
        }
        finished.push(Box::new(callback));
    }

    /// Attaches the transport and parents the item's token under `parent`.
    /// Returns false if the item was already bound.
    pub fn bind(&self, client: Client, parent: &CancellationToken) -> bool {
        self.binding
            .set(Binding {
                client,
                token: parent.child_token(),
            })
            .is_ok()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.get().is_some()
    }

    pub fn segment_count(&self) -> usize {
        self.list.lock().slots.len()
    }

    pub fn segment(&self, id: SegmentId) -> Option<Arc<Segment>> {
        let list = self.list.lock();
        list.position(id).map(|idx| list.slots[idx].segment.clone())
    }

    /// Snapshots of every segment, in range order.
    pub fn segments(&self) -> Vec<SegmentSnapshot> {
        self.list
            .lock()
            .slots
            .iter()
            .map(|slot| slot.segment.snapshot())
            .collect()
    }

    pub fn calculate_transferred_length(&self) -> u64 {
        self.list
            .lock()
            .slots
            .iter()
            .map(|slot| slot.segment.transferred())
            .sum()
    }

    pub fn calculate_remaining_length(&self) -> u64 {
        match self.content_length() {
            Some(total) => total.saturating_sub(self.calculate_transferred_length()),
            None => 0,
        }
    }

    /// Creates a segment for `[start, end]` and returns its transfer.
    ///
    /// The first segment of an item is always unranged from offset 0 and moves
    /// the item to `Starting`. With `after`, this is a split: the segment at
    /// `after` is shrunk to end at `start - 1` and the new one inherits its old
    /// end. A split that no longer fits (the predecessor finished or wrote past
    /// `start`) is rejected with `None`.
    pub fn new_segment(
        self: &Arc<Self>,
        start: u64,
        end: Option<u64>,
        on_error: Option<ErrorHandler>,
        after: Option<SegmentId>,
    ) -> Option<SegmentRun> {
        let Some(binding) = self.binding.get() else {
            warn!("item {} is not bound to a scheduler", self.source);
            return None;
        };

        let mut list = self.list.lock();
        let first = list.slots.is_empty();
        if first {
            if after.is_some() || !self.transition(ItemStatus::Starting) {
                return None;
            }
            if let Err(err) = prepare_target(&self.target) {
                error!("cannot prepare {:?}: {err}", self.target);
                self.transition(ItemStatus::Failed);
                return None;
            }
        } else if !self.status().is_active() {
            return None;
        }

        let (position, end) = match after {
            Some(after) => {
                let idx = list.position(after)?;
                let old_end = list.slots[idx].segment.shrink_for_split(start)?;
                if end.is_some_and(|end| end != old_end) {
                    debug!("split of {after} adjusted end {end:?} to {old_end}");
                }
                (idx + 1, Some(old_end))
            }
            None => (list.slots.len(), end),
        };

        let id = SegmentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let on_end = self.end_callback();
        let segment = Segment::new(
            id,
            SegmentSpec {
                source: self.source.clone(),
                target: self.target.clone(),
                start,
                end,
                chunk_size: self.chunk_size,
                retry_count: self.retry_count,
                enable_range: !first,
            },
            binding.token.child_token(),
            Some(on_end.clone()),
        );
        list.slots.insert(
            position,
            Slot {
                segment: segment.clone(),
                on_end,
                on_error,
            },
        );
        drop(list);

        if first {
            let item = Arc::downgrade(self);
            segment.when(SegmentStatus::Running, move |segment| {
                if let Some(item) = item.upgrade() {
                    item.on_first_running(segment);
                }
            });
            info!("{} -> {:?}: started", self.source, self.target);
        } else {
            debug!(
                "{}: segment {id} takes {start}..={}",
                self.source,
                end.map(|end| end.to_string()).unwrap_or_else(|| "?".into())
            );
        }

        Some(segment.start(binding.client.clone()).boxed())
    }

    /// Replaces the segment `id` with a fresh one over the same range, keeping
    /// its place in the list. `is_retry` charges one retry to the replacement.
    pub fn restart_segment(self: &Arc<Self>, id: SegmentId, is_retry: bool) -> Restart {
        let Some(binding) = self.binding.get() else {
            return Restart::Skipped;
        };
        if !self.status().is_active() {
            return Restart::Skipped;
        }

        let mut list = self.list.lock();
        let Some(idx) = list.position(id) else {
            return Restart::Skipped;
        };
        let old = list.slots[idx].segment.clone();
        if old.status().is_terminal() {
            return Restart::Skipped;
        }

        let retries = if is_retry {
            old.retries_left().saturating_sub(1)
        } else {
            old.retries_left()
        };
        let end = old.seal();

        if retries == 0 {
            let on_error = list.slots[idx].on_error.clone();
            drop(list);
            warn!("{}: segment {id} stalled with no retries left", self.source);
            if let Some(on_error) = on_error {
                on_error(self, Terminal::Failed(None), Some(Arc::new(SegmentError::Stalled)));
            }
            self.cancel(true);
            return Restart::Exhausted;
        }

        let new_id = SegmentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let on_end = list.slots[idx].on_end.clone();
        let segment = Segment::new(
            new_id,
            SegmentSpec {
                source: self.source.clone(),
                target: self.target.clone(),
                start: old.start_position(),
                end,
                chunk_size: self.chunk_size,
                retry_count: retries,
                enable_range: old.range_enabled(),
            },
            binding.token.child_token(),
            Some(on_end),
        );
        list.slots[idx].segment = segment.clone();
        drop(list);

        debug!(
            "{}: segment {id} restarted as {new_id} ({retries} retries left)",
            self.source
        );
        Restart::Replaced(segment.start(binding.client.clone()).boxed())
    }

    /// Cancels every segment. Only meaningful while `Starting` or `Running`.
    /// With `mark_failed` the item becomes `Failed` at once; otherwise it
    /// becomes `Cancelled` when the last segment settles.
    pub fn cancel(&self, mark_failed: bool) -> bool {
        if !self.status().is_active() {
            return false;
        }
        if let Some(binding) = self.binding.get() {
            binding.token.cancel();
        }
        if mark_failed {
            self.transition(ItemStatus::Failed);
        }
        self.settle();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.binding
            .get()
            .map(|binding| binding.token.is_cancelled())
            .unwrap_or(false)
    }

    fn end_callback(self: &Arc<Self>) -> EndCallback {
        let item = Arc::downgrade(self);
        Arc::new(move |segment: &Arc<Segment>| {
            if let Some(item) = item.upgrade() {
                item.on_segment_end(segment);
            }
        })
    }

    fn on_first_running(&self, segment: &Segment) {
        let info = segment.response_info();
        *self.resolved.lock() = info.resolved;
        if let Some(total) = info.content_length {
            *self.content_length.lock() = Some(total);
            if let Err(err) = preallocate(&self.target, total) {
                warn!("cannot preallocate {:?}: {err}", self.target);
            }
        }
        if info.refuses_ranges {
            debug!("{} refuses range requests; splitting disabled", self.source);
            self.try_segment.store(false, Ordering::Release);
        }
        self.transition(ItemStatus::Running);
    }

    fn on_segment_end(self: &Arc<Self>, segment: &Arc<Segment>) {
        let terminal = segment.status().terminal().unwrap_or(Terminal::Cancelled);
        let (complete, on_error) = {
            let list = self.list.lock();
            let Some(idx) = list.position(segment.id()) else {
                debug!("{}: superseded segment {} ended", self.source, segment.id());
                return;
            };
            (list.all_succeeded(), list.slots[idx].on_error.clone())
        };

        match terminal {
            Terminal::Success if complete => self.complete(),
            Terminal::Success | Terminal::Cancelled => {}
            Terminal::RangeUnsupported => {
                self.try_segment.store(false, Ordering::Release);
                if let Some(on_error) = on_error {
                    on_error(self, terminal, segment.last_error());
                }
                // Nobody else can fetch the bytes this segment owned.
                self.cancel(true);
            }
            Terminal::Failed(_) => {
                if let Some(on_error) = on_error {
                    on_error(self, terminal, segment.last_error());
                }
                self.cancel(true);
            }
        }
        self.settle();
    }

    fn complete(&self) {
        if !self.transition(ItemStatus::Success) {
            return;
        }
        info!(
            "{} -> {:?}: finished, {}",
            self.source,
            self.target,
            format_bytes(self.calculate_transferred_length())
        );
        let callbacks = std::mem::take(&mut *self.finished.lock());
        for callback in callbacks {
            callback(self);
        }
    }

    /// An item whose segments have all ended without all succeeding is cancelled,
    /// unless it already failed.
    fn settle(&self) {
        let settled = self.list.lock().settled_short();
        if settled && self.status().is_active() && self.transition(ItemStatus::Cancelled) {
            info!("{} -> {:?}: cancelled", self.source, self.target);
        }
    }

    fn transition(&self, next: ItemStatus) -> bool {
        let moved = self.status_tx.send_if_modified(|current| {
            let allowed = match next {
                _ if current.is_terminal() => false,
                ItemStatus::Waiting => false,
                ItemStatus::Starting => *current == ItemStatus::Waiting,
                ItemStatus::Running => *current == ItemStatus::Starting,
                _ => true,
            };
            if allowed {
                *current = next;
            }
            allowed
        });
        if moved {
            debug!("item {} -> {next}", self.source);
        }
        moved
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("source", &self.source.as_str())
            .field("target", &self.target)
            .field("status", &self.status())
            .field("segments", &self.segment_count())
            .finish()
    }
}
