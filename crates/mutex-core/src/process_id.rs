//! ProcessId: identity of a peer in the mutual-exclusion group.
//!
//! A positive integer, unique among currently connected peers. Its decimal
//! text form is the name the peer registers under in the rendezvous directory.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessIdError {
    #[error("Process ID must be a positive integer, got 0")]
    Zero,
    #[error("Invalid process ID: {0}")]
    InvalidFormat(#[from] std::num::ParseIntError),
    #[error("Process ID must be plain decimal without sign, padding or zeros in front, got {0:?}")]
    NonCanonical(String),
}

/// Identity of a connected peer.
///
/// Serializes as a plain JSON number (or a decimal string when used as a map key).
///
/// # Examples
/// ```
/// use mutex_core::ProcessId;
///
/// let id: ProcessId = "3".parse().unwrap();
/// assert_eq!(id.get(), 3);
/// assert_eq!(id.to_string(), "3");
/// assert!("0".parse::<ProcessId>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

impl ProcessId {
    /// The smallest assignable ID.
    pub const FIRST: ProcessId = ProcessId(1);

    /// Wrap a raw ID. Zero is reserved and rejected.
    pub fn new(raw: u32) -> Result<Self, ProcessIdError> {
        if raw == 0 {
            return Err(ProcessIdError::Zero);
        }
        Ok(Self(raw))
    }

    pub fn get(&self) -> u32 {
        self.0
    }

    /// The next candidate ID (saturates at `u32::MAX`).
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProcessId {
    type Err = ProcessIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u32 = s.parse()?;
        // "03" and "+3" would alias the directory name "3".
        if raw.to_string() != s {
            return Err(ProcessIdError::NonCanonical(s.to_string()));
        }
        Self::new(raw)
    }
}

impl TryFrom<u32> for ProcessId {
    type Error = ProcessIdError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ProcessId> for u32 {
    fn from(id: ProcessId) -> u32 {
        id.0
    }
}

impl serde::Serialize for ProcessId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(self.0)
    }
}

// Accepts numbers and decimal strings: clock keys arrive as strings, and
// internally tagged payloads are buffered before they reach us.
impl<'de> serde::Deserialize<'de> for ProcessId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_any(ProcessIdVisitor)
    }
}

struct ProcessIdVisitor;

impl<'de> serde::de::Visitor<'de> for ProcessIdVisitor {
    type Value = ProcessId;

    fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("a positive process ID")
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<ProcessId, E> {
        let raw = u32::try_from(v).map_err(E::custom)?;
        ProcessId::new(raw).map_err(E::custom)
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<ProcessId, E> {
        let raw = u32::try_from(v).map_err(E::custom)?;
        ProcessId::new(raw).map_err(E::custom)
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<ProcessId, E> {
        v.parse().map_err(E::custom)
    }
}
