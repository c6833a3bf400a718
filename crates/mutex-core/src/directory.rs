//! Rendezvous directory for peer discovery and addressing.
//!
//! A directory maps names to endpoints. Transports register under the decimal
//! form of their process ID, list the directory to discover existing peers,
//! and look up a receiver's endpoint at delivery time.
//!
//! Implementations:
//! - [`InMemoryDirectory`]: shared map for peers living in one process
//!
//! Anything that can register, deregister, look up and list names (a gossip
//! view, a static peer list, a config service) can stand in behind the trait.

use crate::ProcessId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Name already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Name not registered: {0}")]
    NotRegistered(String),
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// Raw bytes in flight between two transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sender's process ID (the "return address")
    pub from: ProcessId,
    /// Encoded [`crate::Payload`]
    pub data: Vec<u8>,
}

/// Where to hand a datagram so that the registered transport receives it.
pub type Endpoint = mpsc::UnboundedSender<Datagram>;

/// Shared lookup service used for discovery and self-registration.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Names of every registered endpoint.
    async fn list(&self) -> Result<Vec<String>>;

    /// Bind `name` to `endpoint`. Atomic per name: fails if already taken.
    async fn register(&self, name: &str, endpoint: Endpoint) -> Result<()>;

    /// Remove the binding for `name`.
    async fn deregister(&self, name: &str) -> Result<()>;

    /// Endpoint currently bound to `name`.
    async fn lookup(&self, name: &str) -> Result<Endpoint>;
}

/// Directory shared by transports in the same process.
///
/// Wrap in `Arc` and hand a clone to every transport.
#[derive(Default)]
pub struct InMemoryDirectory {
    bindings: RwLock<HashMap<String, Endpoint>>,
    /// When set, every call fails as if the directory host were down
    unreachable: AtomicBool,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the directory host going down (or coming back).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of bound names.
    pub fn len(&self) -> usize {
        self.bindings.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable(
                "in-memory directory marked unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn list(&self) -> Result<Vec<String>> {
        self.check_reachable()?;
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        Ok(bindings.keys().cloned().collect())
    }

    async fn register(&self, name: &str, endpoint: Endpoint) -> Result<()> {
        self.check_reachable()?;
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        if bindings.contains_key(name) {
            return Err(DirectoryError::AlreadyRegistered(name.to_string()));
        }
        bindings.insert(name.to_string(), endpoint);
        Ok(())
    }

    async fn deregister(&self, name: &str) -> Result<()> {
        self.check_reachable()?;
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        match bindings.remove(name) {
            Some(_) => Ok(()),
            None => Err(DirectoryError::NotRegistered(name.to_string())),
        }
    }

    async fn lookup(&self, name: &str) -> Result<Endpoint> {
        self.check_reachable()?;
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::NotRegistered(name.to_string()))
    }
}
