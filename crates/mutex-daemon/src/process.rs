//! Demo application: a process that wants the critical section now and then.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mutex_core::{Application, CoordinatorError, CoordinatorHandle, Grant, ProcessId};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::DemoConfig;
use crate::monitor::ExclusionMonitor;

pub struct DemoProcess {
    settings: DemoConfig,
    monitor: Arc<ExclusionMonitor>,
    requested: AtomicBool,
    in_critical_section: AtomicBool,
    entries: AtomicU64,
}

fn random_duration(min_ms: u64, max_ms: u64) -> Duration {
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

impl DemoProcess {
    pub fn new(settings: DemoConfig, monitor: Arc<ExclusionMonitor>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            monitor,
            requested: AtomicBool::new(false),
            in_critical_section: AtomicBool::new(false),
            entries: AtomicU64::new(0),
        })
    }

    /// Completed critical sections.
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }

    /// Roll the dice once; request the critical section on a hit.
    ///
    /// Returns whether a request was made.
    pub fn maybe_request(&self, handle: &CoordinatorHandle) -> Result<bool, CoordinatorError> {
        if self.requested.load(Ordering::SeqCst) || self.in_critical_section.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if !rand::rng().random_bool(self.settings.request_probability) {
            return Ok(false);
        }

        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = handle.request_critical_section() {
            self.requested.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!(process = %handle.own_id(), "Requested critical section");
        Ok(true)
    }

    /// Keep deciding until the coordinator stops.
    pub async fn drive(self: Arc<Self>, handle: CoordinatorHandle) {
        loop {
            let pause = random_duration(self.settings.tick_min_ms, self.settings.tick_max_ms);
            tokio::time::sleep(pause).await;

            if let Err(e) = self.maybe_request(&handle) {
                debug!(process = %handle.own_id(), "Stopping demo driver: {}", e);
                break;
            }
        }
    }

    async fn work(&self, process: ProcessId) {
        self.in_critical_section.store(true, Ordering::SeqCst);
        self.monitor.enter(process);
        info!(%process, "Entered critical section");

        let stay = random_duration(self.settings.stay_min_ms, self.settings.stay_max_ms);
        tokio::time::sleep(stay).await;

        info!(%process, "Leaving critical section");
        self.monitor.exit(process);
        self.entries.fetch_add(1, Ordering::SeqCst);
        self.requested.store(false, Ordering::SeqCst);
        self.in_critical_section.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Application for DemoProcess {
    async fn do_critical_section(&self, grant: &Grant) {
        if !self.requested.load(Ordering::SeqCst) {
            debug!(process = %grant.process_id(), "Token passing through, nothing requested");
            return;
        }
        if !grant.can_enter() {
            warn!(process = %grant.process_id(), "Called without permission to enter");
            return;
        }
        self.work(grant.process_id()).await;
    }

    fn in_critical_section(&self) -> bool {
        self.in_critical_section.load(Ordering::SeqCst)
    }

    fn requested_critical_section(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}
