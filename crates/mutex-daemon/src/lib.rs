//! mutex-daemon library: the demo cluster behind the binary.
//!
//! Exposed as a library so integration tests can run a cluster without the
//! command-line layer.

pub mod cluster;
pub mod config;
pub mod monitor;
pub mod process;

pub use cluster::Cluster;
pub use config::{DaemonConfig, DemoConfig, NetworkConfig, Overrides};
pub use monitor::{ExclusionMonitor, MonitorReport};
pub use process::DemoProcess;

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::info;

/// Run a cluster until `shutdown` resolves, then make every peer leave.
///
/// Fails if the monitor saw two processes inside at once.
pub async fn run(config: DaemonConfig, shutdown: impl Future<Output = ()>) -> Result<MonitorReport> {
    config.validate()?;

    info!(
        peers = config.peers,
        delay_ms = config.network.delay_ms,
        jitter_ms = config.network.jitter_ms,
        merge = ?config.request_merge,
        "Starting cluster"
    );
    let cluster = Cluster::start(&config).await?;

    let mut status_timer = tokio::time::interval(Duration::from_secs(config.status_interval_secs));
    status_timer.tick().await;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = status_timer.tick() => cluster.log_status(),
            _ = &mut shutdown => break,
        }
    }

    let report = cluster.shutdown().await;
    if report.violations > 0 {
        bail!(
            "Mutual exclusion violated {} time(s) (max {} inside at once)",
            report.violations,
            report.max_concurrency
        );
    }
    Ok(report)
}
