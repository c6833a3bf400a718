//! Membership transport for the mutual-exclusion group.
//!
//! A transport owns one process identity. On connect it lists the rendezvous
//! directory, claims the smallest free process ID and announces itself to the
//! peers it found. Messages are fire-and-forget: every send spawns its own
//! delayed delivery, so two messages to the same receiver may arrive in
//! either order.
//!
//! Delivery modes:
//! - Delayed: artificial transit delay per message (default 5s)
//! - Buffered: protocol messages wait in a [`NetworkBuffer`] until delivered
//!   by hand (debugging and deterministic tests)
//!
//! Join/leave notifications skip the artificial delay and the buffer.

use crate::buffer::{BufferedMessage, NetworkBuffer};
use crate::directory::{Datagram, Directory, DirectoryError};
use crate::message::{MutexMessage, Notification, NotificationKind, Payload};
use crate::ProcessId;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Registration failed: {0}")]
    Registration(#[source] DirectoryError),

    #[error("No free process ID left in the directory")]
    NoFreeId,

    #[error("Deregistration failed: {0}")]
    Deregistration(#[source] DirectoryError),

    #[error("Delivery to process {receiver} failed: {reason}")]
    Delivery { receiver: ProcessId, reason: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Artificial transit delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Base delay applied to every protocol message (default: 5s)
    pub delay: Duration,
    /// Extra uniformly random delay in `0..=jitter` per message (default: 0)
    pub jitter: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            jitter: Duration::ZERO,
        }
    }
}

impl TransportConfig {
    pub fn new(delay: Duration, jitter: Duration) -> Self {
        Self { delay, jitter }
    }

    /// No artificial delay at all.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Draw the transit time for one message.
    pub fn sample_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let max_extra = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = rand::rng().random_range(0..=max_extra);
        self.delay + Duration::from_millis(extra)
    }
}

/// How protocol messages travel.
#[derive(Clone)]
pub enum Delivery {
    Delayed(TransportConfig),
    Buffered(NetworkBuffer),
}

/// Result of joining the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// ID claimed in the directory
    pub own_id: ProcessId,
    /// Peers that were already present (empty for the bootstrap peer)
    pub existing_peers: Vec<ProcessId>,
}

impl ConnectOutcome {
    /// True when nobody else was around, i.e. this peer must mint the token.
    pub fn is_bootstrap(&self) -> bool {
        self.existing_peers.is_empty()
    }
}

/// Something the coordinator has to react to.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A protocol message arrived
    Message { from: ProcessId, message: MutexMessage },
    /// A peer joined
    PeerConnected(ProcessId),
    /// A peer left, or could not be reached
    PeerDisconnected(ProcessId),
    /// A protocol message we sent could not be delivered and came back
    Undelivered {
        receiver: ProcessId,
        message: MutexMessage,
    },
}

/// Coordinator-facing side of the network.
#[async_trait]
pub trait Transport: Send {
    /// Join the group. Idempotent.
    async fn connect(&mut self) -> Result<ConnectOutcome>;

    /// Leave the group. No-op when not connected.
    async fn disconnect(&mut self) -> Result<()>;

    /// Our ID, `None` while disconnected.
    fn own_id(&self) -> Option<ProcessId>;

    /// Sorted snapshot of connected peers, self included.
    fn connected_ids(&self) -> Vec<ProcessId>;

    /// Schedule delivery of `message` to `receiver`. Returns immediately.
    fn send_message(&self, message: MutexMessage, receiver: ProcessId);

    /// Send `message` to every connected peer, self included.
    fn broadcast_message(&self, message: &MutexMessage);

    /// Wait for the next event. `None` once disconnected.
    ///
    /// Must be cancel-safe: it is raced against other work in `select!`.
    async fn next_event(&mut self) -> Option<TransportEvent>;
}

/// A datagram that could not be delivered, on its way back to the sender.
#[derive(Debug)]
pub(crate) struct Bounce {
    pub receiver: ProcessId,
    pub data: Vec<u8>,
    pub reason: String,
}

/// Look up `receiver` and hand it the datagram; on failure send it back.
pub(crate) async fn route(
    directory: &dyn Directory,
    receiver: ProcessId,
    datagram: Datagram,
    bounce: &mpsc::UnboundedSender<Bounce>,
) -> Result<()> {
    let outcome = match directory.lookup(&receiver.to_string()).await {
        Ok(endpoint) => endpoint
            .send(datagram)
            .map_err(|e| (e.0, "receiver inbox closed".to_string())),
        Err(e) => Err((datagram, e.to_string())),
    };

    match outcome {
        Ok(()) => Ok(()),
        Err((datagram, reason)) => {
            warn!(%receiver, from = %datagram.from, "Delivery failed: {}", reason);
            // The sender may be gone already; then there is nobody left to tell.
            let _ = bounce.send(Bounce {
                receiver,
                data: datagram.data,
                reason: reason.clone(),
            });
            Err(TransportError::Delivery { receiver, reason })
        }
    }
}

/// Live membership state, present only while connected.
struct Link {
    own_id: ProcessId,
    connected: BTreeSet<ProcessId>,
    inbox: mpsc::UnboundedReceiver<Datagram>,
}

impl Link {
    fn others(&self) -> Vec<ProcessId> {
        self.connected
            .iter()
            .copied()
            .filter(|id| *id != self.own_id)
            .collect()
    }
}

/// Directory-backed transport with simulated network delay.
pub struct MembershipTransport {
    directory: Arc<dyn Directory>,
    delivery: Delivery,
    link: Option<Link>,
    bounce_tx: mpsc::UnboundedSender<Bounce>,
    bounce_rx: mpsc::UnboundedReceiver<Bounce>,
    /// Events decoded but not yet handed out
    pending: VecDeque<TransportEvent>,
}

impl MembershipTransport {
    /// Transport with delayed delivery.
    pub fn new(directory: Arc<dyn Directory>, config: TransportConfig) -> Self {
        Self::with_delivery(directory, Delivery::Delayed(config))
    }

    /// Transport whose protocol messages wait in `buffer`.
    pub fn buffered(directory: Arc<dyn Directory>, buffer: NetworkBuffer) -> Self {
        Self::with_delivery(directory, Delivery::Buffered(buffer))
    }

    pub fn with_delivery(directory: Arc<dyn Directory>, delivery: Delivery) -> Self {
        let (bounce_tx, bounce_rx) = mpsc::unbounded_channel();
        Self {
            directory,
            delivery,
            link: None,
            bounce_tx,
            bounce_rx,
            pending: VecDeque::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// IDs currently registered in the directory.
    ///
    /// A directory failure degrades to "nobody there" so a lone peer can
    /// still bootstrap.
    async fn discover(&self) -> BTreeSet<ProcessId> {
        let names = match self.directory.list().await {
            Ok(names) => names,
            Err(e) => {
                warn!("Peer discovery failed, continuing without peers: {}", e);
                return BTreeSet::new();
            }
        };

        names
            .iter()
            .filter_map(|name| match name.parse::<ProcessId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    debug!("Ignoring directory entry {:?}: {}", name, e);
                    None
                }
            })
            .collect()
    }

    /// Send a notification to every other peer, skipping the artificial delay.
    fn notify(&self, notification: Notification) {
        let Some(link) = &self.link else {
            return;
        };
        let data = Payload::from(notification).to_json();
        for receiver in link.others() {
            self.spawn_delivery(link.own_id, receiver, data.clone(), Duration::ZERO);
        }
    }

    fn spawn_delivery(&self, from: ProcessId, receiver: ProcessId, data: Vec<u8>, delay: Duration) {
        let directory = Arc::clone(&self.directory);
        let bounce = self.bounce_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = route(directory.as_ref(), receiver, Datagram { from, data }, &bounce).await;
        });
    }

    /// Hand an encoded protocol message to the configured delivery mode.
    fn dispatch(&self, from: ProcessId, receiver: ProcessId, data: Vec<u8>) {
        match &self.delivery {
            Delivery::Delayed(config) => {
                let delay = config.sample_delay();
                debug!(%from, %receiver, "Message in transit for {:?}", delay);
                self.spawn_delivery(from, receiver, data, delay);
            }
            Delivery::Buffered(buffer) => {
                buffer.push(BufferedMessage::new(
                    receiver,
                    Datagram { from, data },
                    self.bounce_tx.clone(),
                ));
            }
        }
    }

    fn on_datagram(&mut self, datagram: Datagram) {
        let Some(payload) = Payload::from_json(&datagram.data) else {
            warn!(from = %datagram.from, "Dropping undecodable datagram ({} bytes)", datagram.data.len());
            return;
        };

        match payload.into_message() {
            Ok(message) => {
                debug!(from = %datagram.from, "Received {}", message);
                self.pending.push_back(TransportEvent::Message {
                    from: datagram.from,
                    message,
                });
            }
            Err(notification) => self.on_notification(notification),
        }
    }

    fn on_notification(&mut self, notification: Notification) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let id = notification.process_id;
        if id == link.own_id {
            return;
        }

        match notification.kind {
            NotificationKind::Connected => {
                if link.connected.insert(id) {
                    info!(process = %link.own_id, peer = %id, "Peer connected");
                    self.pending.push_back(TransportEvent::PeerConnected(id));
                } else {
                    debug!(peer = %id, "Ignoring CONNECTED for known peer");
                }
            }
            NotificationKind::Disconnected => {
                if link.connected.remove(&id) {
                    info!(process = %link.own_id, peer = %id, "Peer disconnected");
                    self.pending.push_back(TransportEvent::PeerDisconnected(id));
                } else {
                    debug!(peer = %id, "Ignoring DISCONNECTED for unknown peer");
                }
            }
        }
    }

    /// An undeliverable receiver is treated as gone; a bounced protocol
    /// message is handed back so the coordinator can recover it.
    fn on_bounce(&mut self, bounce: Bounce) {
        let Some(link) = self.link.as_mut() else {
            return;
        };

        if bounce.receiver != link.own_id && link.connected.remove(&bounce.receiver) {
            warn!(
                process = %link.own_id,
                peer = %bounce.receiver,
                "Peer unreachable ({}), treating as disconnected",
                bounce.reason
            );
            self.pending
                .push_back(TransportEvent::PeerDisconnected(bounce.receiver));
        }

        if let Some(Ok(message)) = Payload::from_json(&bounce.data).map(Payload::into_message) {
            debug!(
                process = %link.own_id,
                peer = %bounce.receiver,
                kind = message.kind(),
                "Returning undelivered message"
            );
            self.pending.push_back(TransportEvent::Undelivered {
                receiver: bounce.receiver,
                message,
            });
        }
    }
}

#[async_trait]
impl Transport for MembershipTransport {
    async fn connect(&mut self) -> Result<ConnectOutcome> {
        if let Some(link) = &self.link {
            debug!(process = %link.own_id, "Already connected");
            return Ok(ConnectOutcome {
                own_id: link.own_id,
                existing_peers: link.others(),
            });
        }

        let mut known = self.discover().await;
        let (endpoint, inbox) = mpsc::unbounded_channel();

        let mut candidate = ProcessId::FIRST;
        let own_id = loop {
            if !known.contains(&candidate) {
                match self
                    .directory
                    .register(&candidate.to_string(), endpoint.clone())
                    .await
                {
                    Ok(()) => break candidate,
                    Err(DirectoryError::AlreadyRegistered(name)) => {
                        // Somebody claimed it between our list and register.
                        debug!("Lost registration race for {}, trying next ID", name);
                        known.insert(candidate);
                    }
                    Err(e) => return Err(TransportError::Registration(e)),
                }
            }
            if candidate.next() == candidate {
                return Err(TransportError::NoFreeId);
            }
            candidate = candidate.next();
        };

        let existing_peers: Vec<ProcessId> = known.iter().copied().collect();
        let mut connected = known;
        connected.insert(own_id);

        self.link = Some(Link {
            own_id,
            connected,
            inbox,
        });

        info!(
            process = %own_id,
            "Connected with {} existing peer(s)",
            existing_peers.len()
        );
        self.notify(Notification::connected(own_id));

        Ok(ConnectOutcome {
            own_id,
            existing_peers,
        })
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(own_id) = self.own_id() else {
            return Ok(());
        };

        self.notify(Notification::disconnected(own_id));
        self.link = None;
        self.pending.clear();

        self.directory
            .deregister(&own_id.to_string())
            .await
            .map_err(TransportError::Deregistration)?;

        info!(process = %own_id, "Disconnected");
        Ok(())
    }

    fn own_id(&self) -> Option<ProcessId> {
        self.link.as_ref().map(|link| link.own_id)
    }

    fn connected_ids(&self) -> Vec<ProcessId> {
        self.link
            .as_ref()
            .map(|link| link.connected.iter().copied().collect())
            .unwrap_or_default()
    }

    fn send_message(&self, message: MutexMessage, receiver: ProcessId) {
        let Some(link) = &self.link else {
            debug!(%receiver, "Not connected, dropping {}", message);
            return;
        };
        let data = Payload::from(message).to_json();
        self.dispatch(link.own_id, receiver, data);
    }

    fn broadcast_message(&self, message: &MutexMessage) {
        let Some(link) = &self.link else {
            debug!("Not connected, dropping broadcast of {}", message);
            return;
        };

        let data = match message {
            MutexMessage::Request(request) => Payload::Request(*request).to_json(),
            MutexMessage::Token(token) => {
                // Only one peer can ever hold it; a broadcast token is a bug upstream.
                warn!("Refusing to broadcast {}", token);
                return;
            }
        };

        for receiver in link.connected.iter().copied() {
            self.dispatch(link.own_id, receiver, data.clone());
        }
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let link = self.link.as_mut()?;
            tokio::select! {
                datagram = link.inbox.recv() => {
                    let datagram = datagram?;
                    self.on_datagram(datagram);
                }
                Some(bounce) = self.bounce_rx.recv() => {
                    self.on_bounce(bounce);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::message::{Request, Token};

    fn pid(raw: u32) -> ProcessId {
        ProcessId::new(raw).unwrap()
    }

    fn ids(raw: &[u32]) -> Vec<ProcessId> {
        raw.iter().map(|r| pid(*r)).collect()
    }

    fn directory() -> Arc<InMemoryDirectory> {
        Arc::new(InMemoryDirectory::new())
    }

    fn immediate(dir: &Arc<InMemoryDirectory>) -> MembershipTransport {
        MembershipTransport::new(dir.clone(), TransportConfig::immediate())
    }

    async fn expect_event(transport: &mut MembershipTransport) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(30), transport.next_event())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport closed")
    }

    // ==================== Identity assignment ====================

    #[tokio::test]
    async fn test_first_peer_bootstraps_with_id_one() {
        let dir = directory();
        let mut t = immediate(&dir);

        let outcome = t.connect().await.unwrap();
        assert_eq!(outcome.own_id, pid(1));
        assert!(outcome.is_bootstrap());
        assert_eq!(t.own_id(), Some(pid(1)));
        assert_eq!(t.connected_ids(), ids(&[1]));
    }

    #[tokio::test]
    async fn test_ids_are_smallest_free() {
        let dir = directory();
        let mut t1 = immediate(&dir);
        let mut t2 = immediate(&dir);
        let mut t3 = immediate(&dir);

        t1.connect().await.unwrap();
        t2.connect().await.unwrap();
        t3.connect().await.unwrap();
        assert_eq!(t3.connected_ids(), ids(&[1, 2, 3]));

        // Freeing 2 makes it the next assignment.
        t2.disconnect().await.unwrap();
        let mut t4 = immediate(&dir);
        let outcome = t4.connect().await.unwrap();
        assert_eq!(outcome.own_id, pid(2));
        assert_eq!(outcome.existing_peers, ids(&[1, 3]));
    }

    #[tokio::test]
    async fn test_malformed_and_zero_entries_ignored() {
        let dir = directory();
        let (tx, _rx) = mpsc::unbounded_channel();
        dir.register("0", tx.clone()).await.unwrap();
        dir.register("buffer", tx.clone()).await.unwrap();
        // Padded, so it must not make ID 1 look taken.
        dir.register("01", tx.clone()).await.unwrap();
        dir.register("2", tx).await.unwrap();

        let mut t = immediate(&dir);
        let outcome = t.connect().await.unwrap();
        assert_eq!(outcome.own_id, pid(1));
        assert_eq!(outcome.existing_peers, ids(&[2]));
    }

    /// Directory whose list is stale: it hides one registered name, so the
    /// transport first tries an ID that is already taken.
    struct StaleListDirectory {
        inner: InMemoryDirectory,
        hidden: String,
    }

    #[async_trait]
    impl Directory for StaleListDirectory {
        async fn list(&self) -> crate::directory::Result<Vec<String>> {
            let names = self.inner.list().await?;
            Ok(names.into_iter().filter(|n| *n != self.hidden).collect())
        }
        async fn register(
            &self,
            name: &str,
            endpoint: crate::directory::Endpoint,
        ) -> crate::directory::Result<()> {
            self.inner.register(name, endpoint).await
        }
        async fn deregister(&self, name: &str) -> crate::directory::Result<()> {
            self.inner.deregister(name).await
        }
        async fn lookup(&self, name: &str) -> crate::directory::Result<crate::directory::Endpoint> {
            self.inner.lookup(name).await
        }
    }

    #[tokio::test]
    async fn test_lost_registration_race_retries_and_is_not_bootstrap() {
        let dir = Arc::new(StaleListDirectory {
            inner: InMemoryDirectory::new(),
            hidden: "1".to_string(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        dir.inner.register("1", tx).await.unwrap();

        let mut t = MembershipTransport::new(dir, TransportConfig::immediate());
        let outcome = t.connect().await.unwrap();

        assert_eq!(outcome.own_id, pid(2));
        assert_eq!(outcome.existing_peers, ids(&[1]));
        assert!(!outcome.is_bootstrap());
    }

    #[tokio::test]
    async fn test_unreachable_directory_fails_connect() {
        let dir = directory();
        let (tx, _rx) = mpsc::unbounded_channel();
        dir.register("1", tx).await.unwrap();
        dir.set_unreachable(true);

        // Listing fails, and so does registration: the error surfaces.
        let mut t = immediate(&dir);
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Registration(DirectoryError::Unavailable(_))));
        assert!(!t.is_connected());
    }

    /// Directory that cannot list but still registers.
    struct BlindDirectory(InMemoryDirectory);

    #[async_trait]
    impl Directory for BlindDirectory {
        async fn list(&self) -> crate::directory::Result<Vec<String>> {
            Err(DirectoryError::Unavailable("listing disabled".into()))
        }
        async fn register(
            &self,
            name: &str,
            endpoint: crate::directory::Endpoint,
        ) -> crate::directory::Result<()> {
            self.0.register(name, endpoint).await
        }
        async fn deregister(&self, name: &str) -> crate::directory::Result<()> {
            self.0.deregister(name).await
        }
        async fn lookup(&self, name: &str) -> crate::directory::Result<crate::directory::Endpoint> {
            self.0.lookup(name).await
        }
    }

    #[tokio::test]
    async fn test_list_failure_means_no_peers_found() {
        let mut t = MembershipTransport::new(
            Arc::new(BlindDirectory(InMemoryDirectory::new())),
            TransportConfig::immediate(),
        );
        let outcome = t.connect().await.unwrap();
        assert_eq!(outcome.own_id, pid(1));
        assert!(outcome.is_bootstrap());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let dir = directory();
        let mut t = immediate(&dir);
        let first = t.connect().await.unwrap();
        let second = t.connect().await.unwrap();
        assert_eq!(first.own_id, second.own_id);
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_noop() {
        let dir = directory();
        let mut t = immediate(&dir);
        t.disconnect().await.unwrap();
        assert_eq!(t.own_id(), None);
        assert!(t.connected_ids().is_empty());
        assert!(t.next_event().await.is_none());
    }

    // ==================== Membership notifications ====================

    #[tokio::test]
    async fn test_join_and_leave_are_announced() {
        let dir = directory();
        let mut t1 = immediate(&dir);
        let mut t2 = immediate(&dir);
        t1.connect().await.unwrap();
        t2.connect().await.unwrap();

        assert_eq!(expect_event(&mut t1).await, TransportEvent::PeerConnected(pid(2)));
        assert_eq!(t1.connected_ids(), ids(&[1, 2]));

        t2.disconnect().await.unwrap();
        assert_eq!(expect_event(&mut t1).await, TransportEvent::PeerDisconnected(pid(2)));
        assert_eq!(t1.connected_ids(), ids(&[1]));
    }

    #[tokio::test]
    async fn test_duplicate_notifications_are_ignored() {
        let dir = directory();
        let mut t1 = immediate(&dir);
        t1.connect().await.unwrap();

        let endpoint = dir.lookup("1").await.unwrap();
        let connected = Payload::from(Notification::connected(pid(5))).to_json();
        let gone = Payload::from(Notification::disconnected(pid(7))).to_json();
        for data in [connected.clone(), connected, gone] {
            endpoint.send(Datagram { from: pid(5), data }).unwrap();
        }
        // A protocol message marks the end of the notifications.
        let marker = Payload::Request(Request::new(pid(5), 1)).to_json();
        endpoint.send(Datagram { from: pid(5), data: marker }).unwrap();

        assert_eq!(expect_event(&mut t1).await, TransportEvent::PeerConnected(pid(5)));
        assert!(matches!(
            expect_event(&mut t1).await,
            TransportEvent::Message { .. }
        ));
        assert_eq!(t1.connected_ids(), ids(&[1, 5]));
    }

    #[tokio::test]
    async fn test_undecodable_datagram_is_skipped() {
        let dir = directory();
        let mut t1 = immediate(&dir);
        t1.connect().await.unwrap();

        let endpoint = dir.lookup("1").await.unwrap();
        endpoint
            .send(Datagram {
                from: pid(9),
                data: b"garbage".to_vec(),
            })
            .unwrap();
        let request = Payload::Request(Request::new(pid(9), 3)).to_json();
        endpoint.send(Datagram { from: pid(9), data: request }).unwrap();

        assert_eq!(
            expect_event(&mut t1).await,
            TransportEvent::Message {
                from: pid(9),
                message: MutexMessage::Request(Request::new(pid(9), 3)),
            }
        );
    }

    // ==================== Delivery ====================

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_including_self() {
        let dir = directory();
        let mut t1 = immediate(&dir);
        let mut t2 = immediate(&dir);
        t1.connect().await.unwrap();
        t2.connect().await.unwrap();
        assert_eq!(expect_event(&mut t1).await, TransportEvent::PeerConnected(pid(2)));

        let request = MutexMessage::Request(Request::new(pid(1), 1));
        t1.broadcast_message(&request);

        for t in [&mut t1, &mut t2] {
            assert_eq!(
                expect_event(t).await,
                TransportEvent::Message {
                    from: pid(1),
                    message: MutexMessage::Request(Request::new(pid(1), 1)),
                }
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_waits_for_configured_delay() {
        let dir = directory();
        let config = TransportConfig::new(Duration::from_secs(5), Duration::ZERO);
        let mut t1 = MembershipTransport::new(dir.clone(), config.clone());
        let mut t2 = MembershipTransport::new(dir.clone(), config);
        t1.connect().await.unwrap();
        t2.connect().await.unwrap();

        let started = tokio::time::Instant::now();
        t2.send_message(MutexMessage::Token(Token::new()), pid(1));

        // CONNECTED from 2 is not delayed; the token is.
        assert_eq!(expect_event(&mut t1).await, TransportEvent::PeerConnected(pid(2)));
        assert!(started.elapsed() < Duration::from_secs(5));

        let event = expect_event(&mut t1).await;
        assert!(matches!(
            event,
            TransportEvent::Message { message: MutexMessage::Token(_), .. }
        ));
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_sample_delay_within_bounds() {
        let config = TransportConfig::new(Duration::from_millis(100), Duration::from_millis(50));
        for _ in 0..200 {
            let d = config.sample_delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
        assert_eq!(TransportConfig::default().sample_delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let dir = directory();
        let buffer = NetworkBuffer::new(dir.clone());
        let t = MembershipTransport::buffered(dir.clone(), buffer.clone());
        t.send_message(MutexMessage::Request(Request::new(pid(1), 1)), pid(2));
        t.broadcast_message(&MutexMessage::Request(Request::new(pid(1), 1)));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_receiver_bounces_token_back() {
        let dir = directory();
        let mut t1 = immediate(&dir);
        let mut t2 = immediate(&dir);
        t1.connect().await.unwrap();
        t2.connect().await.unwrap();
        assert_eq!(expect_event(&mut t1).await, TransportEvent::PeerConnected(pid(2)));

        // Peer 2 vanishes without saying goodbye.
        dir.deregister("2").await.unwrap();
        drop(t2);

        let mut token = Token::new();
        token.satisfy(pid(1), 1);
        t1.send_message(MutexMessage::Token(token), pid(2));

        assert_eq!(expect_event(&mut t1).await, TransportEvent::PeerDisconnected(pid(2)));
        match expect_event(&mut t1).await {
            TransportEvent::Undelivered {
                receiver,
                message: MutexMessage::Token(t),
            } => {
                assert_eq!(receiver, pid(2));
                assert_eq!(t.satisfied_requests().get(pid(1)), 1);
            }
            other => panic!("Expected bounced token, got {other:?}"),
        }
        assert_eq!(t1.connected_ids(), ids(&[1]));
    }
}
