//! Observable protocol events.
//!
//! Every coordinator reports what it does to an [`EventBus`]. Subscribers
//! (the exclusion monitor, log sinks, tests) register a callback and keep the
//! returned [`Subscription`] alive for as long as they want to listen.
//!
//! Events serialize to JSON as one flat object:
//!
//! ```text
//! {"process":2,"timestamp":1718000000000.0,"type":"tokenForwarded","receiver":3}
//! ```

use crate::ProcessId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    /// Nobody else was around at connect, so this peer minted the token
    Bootstrapped,
    /// A request for the critical section went out to every peer
    #[serde(rename_all = "camelCase")]
    RequestBroadcast { request_number: u64 },
    /// A peer's request was recorded
    #[serde(rename_all = "camelCase")]
    RequestReceived {
        requester: ProcessId,
        request_number: u64,
        /// Counter value after applying the merge rule
        recorded: u64,
    },
    /// The token arrived and the critical section callback is about to run
    #[serde(rename_all = "camelCase")]
    TokenReceived { request_number: u64 },
    /// The critical section callback returned
    #[serde(rename_all = "camelCase")]
    CriticalSectionExited { request_number: u64 },
    /// The token was handed to the transport for `receiver`
    TokenForwarded { receiver: ProcessId },
    /// A token sent to `receiver` came back undelivered and was re-adopted
    TokenReclaimed { receiver: ProcessId },
    PeerConnected { peer: ProcessId },
    PeerDisconnected { peer: ProcessId },
    /// This peer left the group
    Left,
}

/// An event tagged with its origin and wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutexEvent {
    /// Coordinator that emitted the event
    pub process: ProcessId,
    /// Milliseconds since the Unix epoch
    pub timestamp: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl MutexEvent {
    /// Stamp `kind` with the current time.
    pub fn now(process: ProcessId, kind: EventKind) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        Self {
            process,
            timestamp,
            kind,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("MutexEvent serialization should not fail")
    }
}

type Listener = Arc<dyn Fn(&MutexEvent) + Send + Sync>;

/// Keeps a listener registered; dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<EventBus>,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.key);
        }
    }
}

/// Fan-out of [`MutexEvent`]s to registered listeners.
///
/// Share it as `Arc<EventBus>`; one bus may serve a whole cluster.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<BTreeMap<u64, Listener>>,
    next_key: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. It runs synchronously inside [`EventBus::emit`],
    /// in subscription order, so keep it short.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&MutexEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(listener));
        Subscription {
            bus: Arc::downgrade(self),
            key,
        }
    }

    fn remove(&self, key: u64) {
        // try_write: a Subscription dropped from inside a listener must not deadlock.
        if let Ok(mut listeners) = self.listeners.try_write() {
            listeners.remove(&key);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn emit(&self, event: MutexEvent) {
        // Snapshot first so listeners may subscribe without deadlocking.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        for listener in listeners {
            listener(&event);
        }
    }
}
