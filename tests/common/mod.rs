#![allow(dead_code)]

pub mod range_server;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kfetch::{
    build_client, ClientOptions, Item, ItemStatus, ParallelLimit, Scheduler, SchedulerConfig,
    SegmentSnapshot,
};
use reqwest::Url;
use tokio_util::sync::CancellationToken;

pub fn scheduler(config: SchedulerConfig) -> Scheduler {
    let client = build_client(&ClientOptions::default()).expect("client");
    Scheduler::with_parallel_limit(client, config, ParallelLimit::new(16))
}

pub fn fast_rebalance(timeout_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        refresh_interval: Some(Duration::from_millis(50)),
        timeout: Some(Duration::from_millis(timeout_ms)),
        max_parallels: None,
    }
}

pub fn item(url: &str, target: &Path, chunk_size: usize, retries: u32) -> Arc<Item> {
    Item::with_options(Url::parse(url).expect("url"), target, chunk_size, retries)
}

/// Queues `item`, starts the scheduler and waits (bounded) for a terminal status.
pub async fn run_to_end(scheduler: &Scheduler, item: &Arc<Item>) -> ItemStatus {
    scheduler.add_item(item.clone());
    scheduler.start(&CancellationToken::new()).expect("start");
    let status = tokio::time::timeout(Duration::from_secs(30), item.wait())
        .await
        .expect("item did not settle in time");
    scheduler.shutdown().await;
    status
}

/// Asserts the segments tile `[0, total)` with no gaps or overlaps.
pub fn assert_partition(segments: &[SegmentSnapshot], total: u64) {
    assert!(!segments.is_empty());
    let mut expected_start = 0u64;
    for segment in segments {
        assert_eq!(segment.start, expected_start, "gap or overlap at {:?}", segment);
        let end = segment.end.expect("end known");
        assert!(end >= segment.start, "empty range {:?}", segment);
        expected_start = end + 1;
    }
    assert_eq!(expected_start, total);
}
