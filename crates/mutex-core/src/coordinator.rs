//! Suzuki-Kasami token coordinator.
//!
//! One [`SuzukiKasami`] runs per peer as a tokio task. It owns the request
//! clock and (sometimes) the token, and serializes every state change: the
//! application's requests arrive over a command channel, protocol messages and
//! membership changes over the transport, and a single `select!` loop handles
//! one at a time. While the application runs its critical section nothing else
//! is processed by this peer.
//!
//! The token moves only through `send_token`, which refuses to let go while
//! the critical section may be running.

use crate::application::{Application, Grant};
use crate::clock::RequestClock;
use crate::events::{EventBus, EventKind, MutexEvent, Subscription};
use crate::message::{MutexMessage, Request, Token};
use crate::transport::{Transport, TransportError, TransportEvent};
use crate::ProcessId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Coordinator has stopped")]
    Stopped,
}

/// How an incoming request number is applied to the request clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestMerge {
    /// Take the incoming number as is. A reordered, older request can move
    /// the counter backwards.
    #[default]
    Overwrite,
    /// Keep the larger of the stored and incoming numbers.
    Max,
}

impl RequestMerge {
    fn apply(self, stored: u64, incoming: u64) -> u64 {
        match self {
            Self::Overwrite => incoming,
            Self::Max => stored.max(incoming),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub request_merge: RequestMerge,
}

/// Point-in-time view of a coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    /// `None` once the peer has left
    pub own_id: Option<ProcessId>,
    pub holds_token: bool,
    pub can_enter_cs: bool,
    pub requests: RequestClock,
    pub connected: Vec<ProcessId>,
}

impl CoordinatorStatus {
    pub fn can_enter_critical_section(&self) -> bool {
        self.can_enter_cs && self.holds_token
    }
}

enum Command {
    RequestCriticalSection,
    Leave(oneshot::Sender<Result<(), CoordinatorError>>),
}

/// Protocol state of one peer.
pub struct SuzukiKasami<T, A> {
    transport: T,
    application: A,
    config: CoordinatorConfig,
    own_id: ProcessId,
    /// Highest request number heard from every peer
    requests: RequestClock,
    token: Option<Token>,
    can_enter_cs: bool,
    /// Set while the token is being consumed and passed on
    processing_token: bool,
    /// Peers that joined or left while the token was elsewhere. Their grants
    /// are dropped from the token the next time it arrives here.
    stale_grants: BTreeSet<ProcessId>,
    status: watch::Sender<CoordinatorStatus>,
    events: Arc<EventBus>,
}

impl<T: Transport, A: Application> SuzukiKasami<T, A> {
    /// Join the group through `transport`.
    ///
    /// The first peer to join (nobody else found) mints the token.
    pub async fn connect(
        mut transport: T,
        application: A,
        config: CoordinatorConfig,
        events: Arc<EventBus>,
    ) -> Result<Self, CoordinatorError> {
        let outcome = transport.connect().await?;
        let own_id = outcome.own_id;

        let requests: RequestClock = transport
            .connected_ids()
            .into_iter()
            .map(|id| (id, 0))
            .collect();

        let (status, _) = watch::channel(CoordinatorStatus::default());
        let mut coordinator = Self {
            transport,
            application,
            config,
            own_id,
            requests,
            token: None,
            can_enter_cs: false,
            processing_token: false,
            stale_grants: BTreeSet::new(),
            status,
            events,
        };

        if outcome.is_bootstrap() {
            info!(process = %own_id, "No peers found, creating the token");
            coordinator.token = Some(Token::new());
            coordinator.emit(EventKind::Bootstrapped);
        }
        coordinator.publish_status();

        Ok(coordinator)
    }

    pub fn own_id(&self) -> ProcessId {
        self.own_id
    }

    pub fn holds_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn can_enter_critical_section(&self) -> bool {
        self.can_enter_cs && self.holds_token()
    }

    pub fn requests(&self) -> &RequestClock {
        &self.requests
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            own_id: self.transport.own_id(),
            holds_token: self.holds_token(),
            can_enter_cs: self.can_enter_cs,
            requests: self.requests.clone(),
            connected: self.transport.connected_ids(),
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(self.status());
    }

    fn emit(&self, kind: EventKind) {
        self.events.emit(MutexEvent::now(self.own_id, kind));
    }

    pub fn request_critical_section(&mut self) {
        let request_number = self.requests.increment(self.own_id);
        info!(process = %self.own_id, request_number, "Requesting critical section");
        self.transport
            .broadcast_message(&MutexMessage::Request(Request::new(self.own_id, request_number)));
        self.emit(EventKind::RequestBroadcast { request_number });
    }

    pub async fn receive_message(&mut self, message: MutexMessage) {
        match message {
            MutexMessage::Request(request) => self.receive_request(request),
            MutexMessage::Token(token) => self.receive_token(token).await,
        }
    }

    fn receive_request(&mut self, request: Request) {
        let requester = request.requester_id;
        if !self.transport.connected_ids().contains(&requester) {
            debug!(process = %self.own_id, %requester, "Ignoring {} from departed peer", request);
            return;
        }
        let stored = self.requests.get(requester);
        if request.request_number < stored {
            debug!(
                process = %self.own_id,
                %requester,
                stored,
                incoming = request.request_number,
                "Request arrived out of order"
            );
        }

        let recorded = self.config.request_merge.apply(stored, request.request_number);
        self.requests.set(requester, recorded);
        debug!(process = %self.own_id, "Received {}", request);
        self.emit(EventKind::RequestReceived {
            requester,
            request_number: request.request_number,
            recorded,
        });

        if self.holds_token() && !self.processing_token {
            self.send_token(requester);
        }
    }

    async fn receive_token(&mut self, token: Token) {
        self.processing_token = true;
        self.can_enter_cs = true;
        self.adopt_token(token);

        let request_number = self.requests.get(self.own_id);
        info!(process = %self.own_id, request_number, "Token received");
        self.emit(EventKind::TokenReceived { request_number });
        self.publish_status();

        let grant = Grant::new(self.own_id, request_number, self.status.subscribe());
        self.application.do_critical_section(&grant).await;

        self.can_enter_cs = false;
        let own_request = self.requests.get(self.own_id);
        if let Some(token) = self.token.as_mut() {
            token.satisfy(self.own_id, own_request);
        }
        self.emit(EventKind::CriticalSectionExited { request_number });

        self.forward_to_next_requester();
        self.processing_token = false;
    }

    /// A token we sent bounced back: take it again and serve whoever waits.
    async fn receive_undelivered(&mut self, receiver: ProcessId, message: MutexMessage) {
        let token = match message {
            MutexMessage::Token(token) => token,
            MutexMessage::Request(request) => {
                debug!(process = %self.own_id, %receiver, "Undeliverable {}", request);
                return;
            }
        };

        warn!(process = %self.own_id, %receiver, "Token could not be delivered, reclaiming it");
        self.emit(EventKind::TokenReclaimed { receiver });

        let own_pending =
            self.requests.get(self.own_id) > token.satisfied_requests().get(self.own_id);
        if own_pending {
            self.receive_token(token).await;
        } else {
            self.adopt_token(token);
            self.forward_to_next_requester();
        }
    }

    /// Take possession of `token`, clearing grants of peers whose identity
    /// changed while it was away.
    fn adopt_token(&mut self, mut token: Token) {
        for id in std::mem::take(&mut self.stale_grants) {
            if let Some(granted) = token.forget(id) {
                debug!(process = %self.own_id, peer = %id, granted, "Dropped stale grant");
            }
        }
        self.token = Some(token);
    }

    /// Clear `id`'s grant now if we hold the token, or on its next arrival.
    fn invalidate_grant(&mut self, id: ProcessId) {
        match self.token.as_mut() {
            Some(token) => {
                token.forget(id);
            }
            None => {
                self.stale_grants.insert(id);
            }
        }
    }

    fn has_pending_request(&self, id: ProcessId) -> bool {
        self.token
            .as_ref()
            .is_some_and(|token| self.requests.get(id) > token.satisfied_requests().get(id))
    }

    /// Peers above us in ascending order, then peers below us in ascending order.
    fn scan_order(&self) -> Vec<ProcessId> {
        let (higher, lower): (Vec<ProcessId>, Vec<ProcessId>) = self
            .transport
            .connected_ids()
            .into_iter()
            .filter(|id| *id != self.own_id)
            .partition(|id| *id > self.own_id);
        higher.into_iter().chain(lower).collect()
    }

    /// Pass the token to the first waiting peer in scan order.
    fn forward_to_next_requester(&mut self) -> Option<ProcessId> {
        for candidate in self.scan_order() {
            if !self.holds_token() {
                break;
            }
            if self.has_pending_request(candidate) && self.send_token(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn send_token(&mut self, receiver: ProcessId) -> bool {
        if self.can_enter_cs || self.application.in_critical_section() {
            debug!(process = %self.own_id, %receiver, "Critical section active, keeping token");
            return false;
        }
        let Some(token) = self.token.take() else {
            return false;
        };

        info!(process = %self.own_id, %receiver, "Forwarding {}", token);
        self.transport.send_message(MutexMessage::Token(token), receiver);
        self.emit(EventKind::TokenForwarded { receiver });
        self.publish_status();
        true
    }

    pub fn process_connected(&mut self, id: ProcessId) {
        if !self.requests.insert_if_absent(id) {
            return;
        }
        // A reused ID must not inherit the grants of the previous owner.
        self.invalidate_grant(id);
        debug!(process = %self.own_id, peer = %id, "Tracking new peer");
        self.emit(EventKind::PeerConnected { peer: id });
    }

    pub fn process_disconnected(&mut self, id: ProcessId) {
        if self.requests.remove(id).is_none() {
            return;
        }
        self.invalidate_grant(id);
        debug!(process = %self.own_id, peer = %id, "Stopped tracking peer");
        self.emit(EventKind::PeerDisconnected { peer: id });
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { message, .. } => self.receive_message(message).await,
            TransportEvent::PeerConnected(id) => self.process_connected(id),
            TransportEvent::PeerDisconnected(id) => self.process_disconnected(id),
            TransportEvent::Undelivered { receiver, message } => {
                self.receive_undelivered(receiver, message).await
            }
        }
    }

    /// Hand the token on if we hold it, then disconnect.
    pub async fn leave(&mut self) -> Result<(), CoordinatorError> {
        if self.holds_token() && self.forward_to_next_requester().is_none() {
            let heir = self.scan_order().into_iter().min();
            match heir {
                Some(heir) => {
                    info!(process = %self.own_id, %heir, "Leaving, handing token over");
                    self.send_token(heir);
                }
                None => info!(process = %self.own_id, "Last peer leaving, token retires"),
            }
        }

        self.transport.disconnect().await?;
        self.emit(EventKind::Left);
        self.publish_status();
        Ok(())
    }
}

impl<T, A> SuzukiKasami<T, A>
where
    T: Transport + 'static,
    A: Application + 'static,
{
    /// Run the coordinator on its own task.
    ///
    /// The task ends after [`CoordinatorHandle::leave`], when every handle has
    /// been dropped (the peer then leaves), or when the transport closes.
    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = CoordinatorHandle {
            own_id: self.own_id,
            commands: commands_tx,
            status: self.status.subscribe(),
            events: Arc::clone(&self.events),
        };
        let task = tokio::spawn(self.run(commands_rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::RequestCriticalSection) => self.request_critical_section(),
                    Some(Command::Leave(ack)) => {
                        let result = self.leave().await;
                        let _ = ack.send(result);
                        break;
                    }
                    None => {
                        if let Err(e) = self.leave().await {
                            warn!(process = %self.own_id, "Failed to leave: {}", e);
                        }
                        break;
                    }
                },
                event = self.transport.next_event() => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => {
                        info!(process = %self.own_id, "Transport closed");
                        break;
                    }
                },
            }
            self.publish_status();
        }
        debug!(process = %self.own_id, "Coordinator stopped");
    }
}

/// Cloneable remote control for a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    own_id: ProcessId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<CoordinatorStatus>,
    events: Arc<EventBus>,
}

impl CoordinatorHandle {
    /// ID assigned at connect. Stays valid for naming after the peer left.
    pub fn own_id(&self) -> ProcessId {
        self.own_id
    }

    /// Ask for the token. Returns once the request is queued.
    pub fn request_critical_section(&self) -> Result<(), CoordinatorError> {
        self.commands
            .send(Command::RequestCriticalSection)
            .map_err(|_| CoordinatorError::Stopped)
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    pub fn holds_token(&self) -> bool {
        self.status.borrow().holds_token
    }

    pub fn can_enter_critical_section(&self) -> bool {
        self.status.borrow().can_enter_critical_section()
    }

    /// Copy of the request clock.
    pub fn requests(&self) -> RequestClock {
        self.status.borrow().requests.clone()
    }

    /// Receiver that observes every published status.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&CoordinatorStatus) -> bool,
    ) -> Result<CoordinatorStatus, CoordinatorError> {
        let mut status = self.status.clone();
        let matched = status
            .wait_for(predicate)
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        Ok(matched.clone())
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Shorthand for subscribing to this coordinator's event bus.
    pub fn on_event(&self, listener: impl Fn(&MutexEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(listener)
    }

    /// Leave the group, handing the token on if held. The coordinator stops.
    pub async fn leave(&self) -> Result<(), CoordinatorError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Leave(ack_tx))
            .map_err(|_| CoordinatorError::Stopped)?;
        ack_rx.await.map_err(|_| CoordinatorError::Stopped)?
    }
}
