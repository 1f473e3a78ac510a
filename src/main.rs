mod cli;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cli::{Cli, RunConfig};
use futures_util::future::join_all;
use kfetch::progress::{ProgressFinish, ProgressReporter};
use kfetch::{build_client, ClientOptions, Item, ItemStatus, ParallelLimit, Scheduler};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli);

    debug!("CLI arguments: {:?}", cli);
    let config: RunConfig = cli.try_into()?;

    let client = build_client(&ClientOptions::default()).context("failed to build HTTP client")?;
    let scheduler = Arc::new(Scheduler::with_parallel_limit(
        client,
        config.scheduler.clone(),
        ParallelLimit::new(config.global_limit),
    ));

    let items: Vec<Arc<Item>> = config
        .downloads
        .iter()
        .map(|(url, target)| {
            Item::with_options(url.clone(), target.clone(), config.chunk_size, config.retries)
        })
        .collect();
    for item in &items {
        scheduler.add_item(item.clone());
    }

    let token = CancellationToken::new();
    scheduler.start(&token)?;
    let progress = ProgressReporter::spawn(config.progress, items.clone(), scheduler.clone());

    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling downloads");
            interrupt.cancel();
        }
    });

    let statuses = join_all(items.iter().map(|item| wait_for(item, &token))).await;
    scheduler.shutdown().await;

    let failed: Vec<_> = items
        .iter()
        .zip(&statuses)
        .filter(|(_, status)| **status != ItemStatus::Success)
        .collect();

    if let Some(progress) = progress {
        let finish = if failed.is_empty() {
            ProgressFinish::Success
        } else {
            ProgressFinish::Failure
        };
        progress.finish(finish).await;
    }

    for (item, status) in &failed {
        error!("{} -> {:?}: {status}", item.source(), item.target());
    }
    if !failed.is_empty() {
        return Err(anyhow!(
            "{} of {} download(s) did not complete",
            failed.len(),
            items.len()
        ));
    }

    info!("Download completed successfully");
    Ok(())
}

/// Waits for `item` to settle. After an interrupt, an item the scheduler never
/// started is reported as it stands.
async fn wait_for(item: &Arc<Item>, token: &CancellationToken) -> ItemStatus {
    tokio::select! {
        status = item.wait() => status,
        _ = token.cancelled() => {
            if item.status() == ItemStatus::Waiting {
                ItemStatus::Waiting
            } else {
                item.wait().await
            }
        }
    }
}

fn init_logger(cli: &Cli) {
    use env_logger::Env;
    use log::LevelFilter;

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    let level = if cli.quiet {
        LevelFilter::Error
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    builder.filter_level(level);
    if !cli.verbose {
        builder.format_timestamp_secs();
    }
    let _ = builder.try_init();
}
