//! Manual delivery buffer.
//!
//! A transport in buffered mode parks every protocol message here instead of
//! delivering it after a delay. An operator (or a test) inspects the pending
//! messages and releases them one by one, in any order, to provoke specific
//! interleavings.

use crate::directory::{Datagram, Directory};
use crate::message::Payload;
use crate::transport::{route, Bounce, TransportError};
use crate::ProcessId;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("No buffered message at index {0}")]
    NoSuchMessage(usize),

    #[error(transparent)]
    Delivery(#[from] TransportError),
}

/// A parked message with everything needed to deliver it later.
pub(crate) struct BufferedMessage {
    to: ProcessId,
    datagram: Datagram,
    bounce: mpsc::UnboundedSender<Bounce>,
}

impl BufferedMessage {
    pub(crate) fn new(to: ProcessId, datagram: Datagram, bounce: mpsc::UnboundedSender<Bounce>) -> Self {
        Self {
            to,
            datagram,
            bounce,
        }
    }

    fn describe(&self, index: usize) -> PendingMessage {
        let summary = match Payload::from_json(&self.datagram.data) {
            Some(payload) => format!("{} to Process {}", payload, self.to),
            None => format!("{} undecodable bytes to Process {}", self.datagram.data.len(), self.to),
        };
        PendingMessage {
            index,
            from: self.datagram.from,
            to: self.to,
            summary,
        }
    }
}

/// Operator view of a buffered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Position in the buffer, valid until the buffer changes
    pub index: usize,
    pub from: ProcessId,
    pub to: ProcessId,
    /// e.g. "Request number 1 from Process 3 to Process 1"
    pub summary: String,
}

/// Shared buffer of undelivered protocol messages.
///
/// Cheap to clone; all clones see the same messages.
#[derive(Clone)]
pub struct NetworkBuffer {
    directory: Arc<dyn Directory>,
    messages: Arc<Mutex<Vec<BufferedMessage>>>,
}

impl NetworkBuffer {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn push(&self, message: BufferedMessage) {
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        debug!(to = %message.to, "Buffered message #{}", messages.len());
        messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the pending messages, oldest first.
    pub fn pending(&self) -> Vec<PendingMessage> {
        let messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages
            .iter()
            .enumerate()
            .map(|(index, message)| message.describe(index))
            .collect()
    }

    fn take(&self, index: usize) -> Result<BufferedMessage, BufferError> {
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        if index >= messages.len() {
            return Err(BufferError::NoSuchMessage(index));
        }
        Ok(messages.remove(index))
    }

    /// Deliver the message at `index` now.
    ///
    /// The message leaves the buffer either way; an unreachable receiver
    /// bounces it back to its sender.
    pub async fn deliver(&self, index: usize) -> Result<(), BufferError> {
        let message = self.take(index)?;
        info!("Delivering {}", message.describe(index).summary);
        route(
            self.directory.as_ref(),
            message.to,
            message.datagram,
            &message.bounce,
        )
        .await?;
        Ok(())
    }

    /// Deliver every pending message, oldest first. Returns how many arrived.
    pub async fn deliver_all(&self) -> usize {
        let drained: Vec<BufferedMessage> = {
            let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
            messages.drain(..).collect()
        };

        let mut delivered = 0;
        for message in drained {
            let result = route(
                self.directory.as_ref(),
                message.to,
                message.datagram,
                &message.bounce,
            )
            .await;
            if result.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop the message at `index` without delivering it.
    pub fn discard(&self, index: usize) -> Result<PendingMessage, BufferError> {
        let message = self.take(index)?;
        let described = message.describe(index);
        info!("Discarded {}", described.summary);
        Ok(described)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::message::{MutexMessage, Request, Token};
    use crate::transport::{MembershipTransport, Transport, TransportEvent};
    use std::time::Duration;

    fn pid(raw: u32) -> ProcessId {
        ProcessId::new(raw).unwrap()
    }

    async fn buffered_pair() -> (NetworkBuffer, MembershipTransport, MembershipTransport) {
        let dir = Arc::new(InMemoryDirectory::new());
        let buffer = NetworkBuffer::new(dir.clone());
        let mut t1 = MembershipTransport::buffered(dir.clone(), buffer.clone());
        let mut t2 = MembershipTransport::buffered(dir.clone(), buffer.clone());
        t1.connect().await.unwrap();
        t2.connect().await.unwrap();
        // CONNECTED bypasses the buffer.
        assert_eq!(next(&mut t1).await, TransportEvent::PeerConnected(pid(2)));
        (buffer, t1, t2)
    }

    async fn next(transport: &mut MembershipTransport) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), transport.next_event())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_messages_wait_in_buffer() {
        let (buffer, t1, _t2) = buffered_pair().await;

        t1.broadcast_message(&MutexMessage::Request(Request::new(pid(1), 1)));

        let pending = buffer.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].index, 0);
        assert_eq!(pending[0].from, pid(1));
        assert_eq!(pending[0].to, pid(1));
        assert_eq!(pending[1].to, pid(2));
        assert_eq!(
            pending[1].summary,
            "Request number 1 from Process 1 to Process 2"
        );
    }

    #[tokio::test]
    async fn test_deliver_out_of_order() {
        let (buffer, t1, mut t2) = buffered_pair().await;

        t1.send_message(MutexMessage::Request(Request::new(pid(1), 1)), pid(2));
        t1.send_message(MutexMessage::Request(Request::new(pid(1), 2)), pid(2));

        // Release the second one first.
        buffer.deliver(1).await.unwrap();
        buffer.deliver(0).await.unwrap();
        assert!(buffer.is_empty());

        let first = next(&mut t2).await;
        let second = next(&mut t2).await;
        assert_eq!(
            first,
            TransportEvent::Message {
                from: pid(1),
                message: MutexMessage::Request(Request::new(pid(1), 2)),
            }
        );
        assert_eq!(
            second,
            TransportEvent::Message {
                from: pid(1),
                message: MutexMessage::Request(Request::new(pid(1), 1)),
            }
        );
    }

    #[tokio::test]
    async fn test_deliver_bad_index() {
        let (buffer, _t1, _t2) = buffered_pair().await;
        assert!(matches!(
            buffer.deliver(0).await,
            Err(BufferError::NoSuchMessage(0))
        ));
        assert!(matches!(buffer.discard(3), Err(BufferError::NoSuchMessage(3))));
    }

    #[tokio::test]
    async fn test_discard_drops_message() {
        let (buffer, t1, _t2) = buffered_pair().await;
        t1.send_message(MutexMessage::Token(Token::new()), pid(2));

        let dropped = buffer.discard(0).unwrap();
        assert_eq!(dropped.summary, "Token {} to Process 2");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_all_in_order() {
        let (buffer, t1, mut t2) = buffered_pair().await;
        for n in 1..=3 {
            t1.send_message(MutexMessage::Request(Request::new(pid(1), n)), pid(2));
        }

        assert_eq!(buffer.deliver_all().await, 3);
        for n in 1..=3 {
            assert_eq!(
                next(&mut t2).await,
                TransportEvent::Message {
                    from: pid(1),
                    message: MutexMessage::Request(Request::new(pid(1), n)),
                }
            );
        }
    }

    #[tokio::test]
    async fn test_deliver_to_departed_peer_bounces() {
        let (buffer, mut t1, mut t2) = buffered_pair().await;
        t1.send_message(MutexMessage::Token(Token::new()), pid(2));
        t2.disconnect().await.unwrap();
        assert_eq!(next(&mut t1).await, TransportEvent::PeerDisconnected(pid(2)));

        let err = buffer.deliver(0).await.unwrap_err();
        assert!(matches!(
            err,
            BufferError::Delivery(TransportError::Delivery { receiver, .. }) if receiver == pid(2)
        ));

        assert!(matches!(
            next(&mut t1).await,
            TransportEvent::Undelivered {
                message: MutexMessage::Token(_),
                ..
            }
        ));
    }
}
