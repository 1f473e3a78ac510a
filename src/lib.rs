//! Resumable, adaptively parallel file downloads.
//!
//! An [`Item`] is one file. It starts with a single unranged [`Segment`]; a
//! [`Scheduler`] then watches every running segment and, when one is too slow to
//! finish within its stall window, splits the unfinished half of its range into
//! a new ranged segment. Stalled segments are restarted in place.

pub mod download;
pub mod error;
pub mod progress;
pub mod scheduler;
pub mod util;

pub use download::{
    build_client, ClientOptions, Defaults, ErrorHandler, Item, ItemStatus, Segment, SegmentId,
    SegmentSnapshot, SegmentStatus, Terminal,
};
pub use error::{SchedulerError, SegmentError};
pub use scheduler::{ParallelLimit, Scheduler, SchedulerConfig, SchedulerSnapshot};
