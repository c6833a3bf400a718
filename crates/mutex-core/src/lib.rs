//! mutex-core: token-based distributed mutual exclusion (Suzuki-Kasami).
//!
//! This crate provides:
//! - The Suzuki-Kasami coordinator, run as one tokio task per peer
//! - A membership transport over a rendezvous directory, with simulated delay
//! - A manual delivery buffer for provoking specific interleavings
//! - The `Application` seam for the code guarded by the critical section
//! - Status snapshots and an event bus for monitoring

pub mod application;
pub mod buffer;
pub mod clock;
pub mod coordinator;
pub mod directory;
pub mod events;
pub mod message;
pub mod process_id;
pub mod transport;

pub use application::{Application, Grant};
pub use buffer::{BufferError, NetworkBuffer, PendingMessage};
pub use clock::{ClockOrdering, RequestClock};
pub use coordinator::{
    CoordinatorConfig, CoordinatorError, CoordinatorHandle, CoordinatorStatus, RequestMerge,
    SuzukiKasami,
};
pub use directory::{Datagram, Directory, DirectoryError, Endpoint, InMemoryDirectory};
pub use events::{EventBus, EventKind, MutexEvent, Subscription};
pub use message::{MutexMessage, Notification, NotificationKind, Payload, Request, Token};
pub use process_id::{ProcessId, ProcessIdError};
pub use transport::{
    ConnectOutcome, Delivery, MembershipTransport, Transport, TransportConfig, TransportError,
    TransportEvent,
};
