//! Protocol message types.
//!
//! Everything that crosses the transport is a [`Payload`], sent as
//! `type`-tagged camelCase JSON:
//!
//! ```text
//! {"type":"request","requesterId":3,"requestNumber":1}
//! {"type":"token","satisfiedRequests":{"1":0,"3":1}}
//! {"type":"notification","kind":"connected","processId":2}
//! ```

use crate::{ProcessId, RequestClock};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Ask every peer for the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Process asking for its critical section
    pub requester_id: ProcessId,
    /// Per-requester sequence number, starting at 1
    pub request_number: u64,
}

impl Request {
    pub fn new(requester_id: ProcessId, request_number: u64) -> Self {
        Self {
            requester_id,
            request_number,
        }
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Request number {} from Process {}",
            self.request_number, self.requester_id
        )
    }
}

/// The single capability that authorizes entry into the critical section.
///
/// Not `Clone`: handing it to the transport moves it out of the holder.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    /// Highest request number already granted, per process
    satisfied_requests: RequestClock,
}

impl Token {
    /// Mint the token. Only the bootstrap peer does this.
    pub fn new() -> Self {
        Self {
            satisfied_requests: RequestClock::new(),
        }
    }

    pub fn with_satisfied(satisfied_requests: RequestClock) -> Self {
        Self { satisfied_requests }
    }

    pub fn satisfied_requests(&self) -> &RequestClock {
        &self.satisfied_requests
    }

    /// Record that `process` had request `request_number` granted.
    pub fn satisfy(&mut self, process: ProcessId, request_number: u64) {
        self.satisfied_requests.set(process, request_number);
    }

    /// Drop the entry of a process that left.
    pub fn forget(&mut self, process: ProcessId) -> Option<u64> {
        self.satisfied_requests.remove(process)
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Token {}", self.satisfied_requests)
    }
}

/// Membership event announced by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: NotificationKind,
    /// Process that joined or left
    pub process_id: ProcessId,
}

impl Notification {
    pub fn connected(process_id: ProcessId) -> Self {
        Self {
            kind: NotificationKind::Connected,
            process_id,
        }
    }

    pub fn disconnected(process_id: ProcessId) -> Self {
        Self {
            kind: NotificationKind::Disconnected,
            process_id,
        }
    }
}

/// Messages the coordinator sends and receives.
#[derive(Debug, PartialEq, Eq)]
pub enum MutexMessage {
    Request(Request),
    Token(Token),
}

impl MutexMessage {
    /// Short kind name for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Token(_) => "token",
        }
    }
}

impl Display for MutexMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(request) => request.fmt(f),
            Self::Token(token) => token.fmt(f),
        }
    }
}

impl From<Request> for MutexMessage {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Token> for MutexMessage {
    fn from(token: Token) -> Self {
        Self::Token(token)
    }
}

/// Wire envelope: every datagram body is exactly one payload.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Payload {
    Request(Request),
    Token(Token),
    Notification(Notification),
}

impl Payload {
    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Payload serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    /// Split into a protocol message or a membership notification.
    pub fn into_message(self) -> Result<MutexMessage, Notification> {
        match self {
            Self::Request(request) => Ok(MutexMessage::Request(request)),
            Self::Token(token) => Ok(MutexMessage::Token(token)),
            Self::Notification(notification) => Err(notification),
        }
    }
}

impl From<MutexMessage> for Payload {
    fn from(message: MutexMessage) -> Self {
        match message {
            MutexMessage::Request(request) => Self::Request(request),
            MutexMessage::Token(token) => Self::Token(token),
        }
    }
}

impl From<Notification> for Payload {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

impl Display for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(request) => request.fmt(f),
            Self::Token(token) => token.fmt(f),
            Self::Notification(n) => match n.kind {
                NotificationKind::Connected => write!(f, "Process {} connected", n.process_id),
                NotificationKind::Disconnected => {
                    write!(f, "Process {} disconnected", n.process_id)
                }
            },
        }
    }
}
