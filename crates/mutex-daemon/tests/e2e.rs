//! End-to-end tests for mutex-daemon.
//!
//! Runs the demo cluster the way the binary does, on a paused clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mutex_core::{EventKind, ProcessId, RequestMerge};
use mutex_daemon::{run, Cluster, DaemonConfig, DemoConfig, NetworkConfig};
use tempfile::TempDir;

fn busy_config(peers: usize) -> DaemonConfig {
    DaemonConfig {
        peers,
        network: NetworkConfig {
            delay_ms: 200,
            jitter_ms: 0,
        },
        demo: DemoConfig {
            tick_min_ms: 100,
            tick_max_ms: 300,
            request_probability: 0.5,
            stay_min_ms: 50,
            stay_max_ms: 150,
        },
        status_interval_secs: 5,
        ..DaemonConfig::default()
    }
}

// ============================================================================
// Full runs
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_run_keeps_mutual_exclusion() {
    let report = run(busy_config(4), tokio::time::sleep(Duration::from_secs(120)))
        .await
        .expect("run should succeed");

    assert!(report.entries > 0, "somebody should have entered");
    assert_eq!(report.max_concurrency, 1);
    assert_eq!(report.violations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_with_jitter_and_max_merge() {
    let mut config = busy_config(3);
    config.network.jitter_ms = 400;
    config.request_merge = RequestMerge::Max;

    let report = run(config, tokio::time::sleep(Duration::from_secs(120)))
        .await
        .expect("run should succeed");
    assert!(report.entries > 0);
    assert_eq!(report.violations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mutex.json");
    std::fs::write(&path, serde_json::to_string(&busy_config(2)).unwrap()).unwrap();

    let config = DaemonConfig::load(&path).unwrap();
    assert_eq!(config.peers, 2);

    let report = run(config, tokio::time::sleep(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(report.violations, 0);
}

#[tokio::test]
async fn test_run_rejects_invalid_config() {
    let config = DaemonConfig {
        peers: 0,
        ..DaemonConfig::default()
    };
    assert!(run(config, async {}).await.is_err());
}

// ============================================================================
// Cluster
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cluster_assigns_sequential_ids_and_one_token() {
    let cluster = Cluster::start(&busy_config(3)).await.unwrap();
    assert_eq!(cluster.len(), 3);

    let handles = cluster.handles();
    let ids: Vec<u32> = handles.iter().map(|h| h.own_id().get()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(handles[0].holds_token());
    assert!(!handles[1].holds_token());
    assert!(!handles[2].holds_token());

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_token_moves_between_peers() {
    let cluster = Cluster::start(&busy_config(3)).await.unwrap();

    let receivers: Arc<Mutex<Vec<ProcessId>>> = Arc::default();
    let sink = receivers.clone();
    let _sub = cluster.events().subscribe(move |event| {
        if let EventKind::TokenForwarded { receiver } = event.kind {
            if receiver != event.process {
                sink.lock().unwrap().push(receiver);
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    let report = cluster.shutdown().await;

    assert!(!receivers.lock().unwrap().is_empty(), "token never left its holder");
    assert_eq!(report.violations, 0);
}
