mod client;
mod file;
mod item;
mod range;
mod segment;
mod status;

pub use client::{build_client, ClientOptions};
pub use item::{ErrorHandler, Item, Restart, SegmentRun};
pub use range::{parse_content_range, range_header, ContentRange};
pub use segment::{
    EndCallback, ResponseInfo, Segment, SegmentId, SegmentSnapshot, SegmentSpec,
};
pub use status::{ItemStatus, SegmentStatus, Terminal};

use std::time::Duration;

/// Process-wide fallbacks for anything not configured explicitly.
pub struct Defaults;

impl Defaults {
    pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);
    pub const TIMEOUT: Duration = Duration::from_secs(10);
    pub const PARALLEL_TASK_LIMIT: usize = 16;
    pub const CHUNK_SIZE: usize = 16 * 1024;
    pub const RETRY_COUNT: u32 = 3;
    pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);
}
