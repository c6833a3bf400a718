//! mutex-daemon: runs a group of Suzuki-Kasami peers in one process.
//!
//! Each peer hosts a demo application that asks for the critical section at
//! random. Messages travel through an in-memory directory with a simulated
//! transit delay, so the token can be watched moving around in the logs.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mutex_core::RequestMerge;
use mutex_daemon::{DaemonConfig, Overrides};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Merge {
    /// Take incoming request numbers as they are
    Overwrite,
    /// Never let a request number go down
    Max,
}

impl From<Merge> for RequestMerge {
    fn from(merge: Merge) -> Self {
        match merge {
            Merge::Overwrite => RequestMerge::Overwrite,
            Merge::Max => RequestMerge::Max,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "mutex-daemon")]
#[command(about = "Token-based distributed mutual exclusion demo")]
struct Args {
    /// JSON config file (created with defaults if missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of peers to start
    #[arg(short, long)]
    peers: Option<usize>,

    /// Base transit delay per message in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Extra random transit delay in milliseconds
    #[arg(long)]
    jitter_ms: Option<u64>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    duration_secs: Option<u64>,

    /// How incoming request numbers are merged
    #[arg(long, value_enum)]
    merge: Option<Merge>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mutex_core=debug,mutex_daemon=debug"
    } else {
        "info,mutex_core=info,mutex_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting mutex-daemon");

    let config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    let config = config.apply(Overrides {
        peers: args.peers,
        delay_ms: args.delay_ms,
        jitter_ms: args.jitter_ms,
        duration_secs: args.duration_secs,
        request_merge: args.merge.map(RequestMerge::from),
    });

    let duration = config.duration_secs;
    let shutdown = async move {
        match duration {
            Some(secs) => {
                info!("Running for {}s", secs);
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            None => {
                info!("Running. Press Ctrl+C to stop.");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
            }
        }
    };

    let report = mutex_daemon::run(config, shutdown).await?;
    info!(
        "Done: {} critical section(s), at most {} inside at once",
        report.entries, report.max_concurrency
    );
    Ok(())
}
