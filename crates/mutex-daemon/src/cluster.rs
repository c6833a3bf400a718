//! A group of demo peers sharing one in-memory directory.

use std::sync::Arc;

use anyhow::{Context, Result};
use mutex_core::{
    CoordinatorHandle, EventBus, InMemoryDirectory, MembershipTransport, Subscription,
    SuzukiKasami,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::monitor::{ExclusionMonitor, MonitorReport};
use crate::process::DemoProcess;

struct ClusterPeer {
    handle: CoordinatorHandle,
    process: Arc<DemoProcess>,
    coordinator: JoinHandle<()>,
    driver: JoinHandle<()>,
}

pub struct Cluster {
    peers: Vec<ClusterPeer>,
    monitor: Arc<ExclusionMonitor>,
    events: Arc<EventBus>,
    _event_log: Subscription,
}

impl Cluster {
    /// Start `config.peers` peers one after another.
    ///
    /// Sequential joins give the IDs 1..=n; the first peer holds the token.
    pub async fn start(config: &DaemonConfig) -> Result<Self> {
        let directory = Arc::new(InMemoryDirectory::new());
        let monitor = Arc::new(ExclusionMonitor::new());
        let events = Arc::new(EventBus::new());
        let event_log = events.subscribe(|event| debug!(target: "mutex_events", "{}", event.to_json()));

        let mut peers = Vec::with_capacity(config.peers);
        for n in 1..=config.peers {
            let transport = MembershipTransport::new(directory.clone(), config.transport_config());
            let process = DemoProcess::new(config.demo.clone(), monitor.clone());
            let coordinator = SuzukiKasami::connect(
                transport,
                process.clone(),
                config.coordinator_config(),
                events.clone(),
            )
            .await
            .with_context(|| format!("Failed to start peer {} of {}", n, config.peers))?;

            let (handle, coordinator) = coordinator.spawn();
            info!(process = %handle.own_id(), "Peer started");
            let driver = tokio::spawn(process.clone().drive(handle.clone()));

            peers.push(ClusterPeer {
                handle,
                process,
                coordinator,
                driver,
            });
        }

        Ok(Self {
            peers,
            monitor,
            events,
            _event_log: event_log,
        })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn handles(&self) -> Vec<CoordinatorHandle> {
        self.peers.iter().map(|p| p.handle.clone()).collect()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn report(&self) -> MonitorReport {
        self.monitor.report()
    }

    /// Log one line per peer.
    pub fn log_status(&self) {
        for peer in &self.peers {
            let status = peer.handle.status();
            info!(
                process = %peer.handle.own_id(),
                holds_token = status.holds_token,
                can_enter = status.can_enter_critical_section(),
                entries = peer.process.entries(),
                requests = %status.requests,
                "Status"
            );
        }
        let holders = self.peers.iter().filter(|p| p.handle.holds_token()).count();
        if holders > 1 {
            warn!(holders, "More than one peer reports holding the token");
        }
    }

    /// Stop the demo drivers and make every peer leave.
    pub async fn shutdown(self) -> MonitorReport {
        for peer in &self.peers {
            peer.driver.abort();
        }

        // Sequential, so every hand-over finds a receiver that is still connected.
        let mut coordinators = Vec::with_capacity(self.peers.len());
        for peer in self.peers {
            if let Err(e) = peer.handle.leave().await {
                warn!(process = %peer.handle.own_id(), "Leave failed: {}", e);
            }
            coordinators.push(peer.coordinator);
        }
        for result in futures::future::join_all(coordinators).await {
            if let Err(e) = result {
                warn!("Coordinator task ended abnormally: {}", e);
            }
        }

        let report = self.monitor.report();
        info!(
            entries = report.entries,
            max_concurrency = report.max_concurrency,
            violations = report.violations,
            "Cluster stopped"
        );
        report
    }
}
