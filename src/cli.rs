use std::convert::TryFrom;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use kfetch::progress::ProgressMode;
use kfetch::util::infer_output_paths;
use kfetch::{Defaults, SchedulerConfig};
use url::Url;

#[derive(Parser, Debug, Clone)]
#[command(name = "kfetch", author, version, about = "Adaptive segmented downloader", long_about = None)]
pub struct Cli {
    /// URL(s) to download. Each becomes its own file.
    #[arg(value_name = "url", required = true)]
    pub urls: Vec<String>,

    /// Output file (single URL) or directory
    #[arg(short, long, value_name = "path")]
    pub output: Option<PathBuf>,

    /// Read/write granularity in bytes
    #[arg(long = "chunk-size", value_name = "bytes", default_value_t = Defaults::CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Attempts per segment before it fails
    #[arg(short = 'r', long = "retries", value_name = "int", default_value_t = Defaults::RETRY_COUNT)]
    pub retries: u32,

    /// Maximum parallel segments for this run
    #[arg(short = 'p', long = "parallel", value_name = "int")]
    pub parallel: Option<usize>,

    /// Process-wide cap on parallel segments
    #[arg(long = "global-limit", value_name = "int")]
    pub global_limit: Option<usize>,

    /// Seconds a chunk may take before its segment is restarted
    #[arg(long = "timeout", value_name = "secs")]
    pub timeout: Option<u64>,

    /// Milliseconds between rebalancing passes
    #[arg(long = "refresh-ms", value_name = "ms")]
    pub refresh_ms: Option<u64>,

    /// Quiet mode
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Stream progress as newline-delimited JSON
    #[arg(long = "json", action = ArgAction::SetTrue)]
    pub json: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub downloads: Vec<(Url, PathBuf)>,
    pub chunk_size: usize,
    pub retries: u32,
    pub global_limit: usize,
    pub scheduler: SchedulerConfig,
    pub progress: ProgressMode,
}

impl TryFrom<Cli> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        if cli.urls.is_empty() {
            return Err(anyhow!("at least one URL is required"));
        }
        if cli.chunk_size == 0 {
            return Err(anyhow!("--chunk-size must be positive"));
        }
        if cli.retries == 0 {
            return Err(anyhow!("--retries must be at least 1"));
        }

        let mut urls = Vec::with_capacity(cli.urls.len());
        for url in &cli.urls {
            let parsed = Url::parse(url).with_context(|| format!("invalid URL: {url}"))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(anyhow!("unsupported URL scheme: {}", parsed.scheme()));
            }
            urls.push(parsed);
        }

        let targets = infer_output_paths(cli.output.clone(), &urls)?;

        let progress = if cli.json {
            ProgressMode::Json
        } else if cli.quiet {
            ProgressMode::Quiet
        } else {
            ProgressMode::Text
        };

        Ok(RunConfig {
            downloads: urls.into_iter().zip(targets).collect(),
            chunk_size: cli.chunk_size,
            retries: cli.retries,
            global_limit: cli
                .global_limit
                .unwrap_or(Defaults::PARALLEL_TASK_LIMIT)
                .max(1),
            scheduler: SchedulerConfig {
                refresh_interval: cli.refresh_ms.map(Duration::from_millis),
                timeout: cli.timeout.map(Duration::from_secs),
                max_parallels: cli.parallel,
            },
            progress,
        })
    }
}
