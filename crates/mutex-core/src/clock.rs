//! Vector of per-process request counters.
//!
//! Used twice by the protocol: each coordinator keeps the highest request
//! number it has heard from every peer, and the token carries the highest
//! request number already granted to every peer. Missing entries read as 0.

use crate::ProcessId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Outcome of comparing two clocks elementwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// At least one entry larger, none smaller.
    Greater,
    /// At least one entry smaller, none larger.
    Smaller,
    /// Every entry equal (absent counts as 0).
    Equal,
    /// Some entries larger and some smaller.
    Simultaneous,
}

impl ClockOrdering {
    /// The ordering seen from the other clock.
    pub fn reverse(self) -> Self {
        match self {
            Self::Greater => Self::Smaller,
            Self::Smaller => Self::Greater,
            other => other,
        }
    }
}

/// Mapping from process ID to request sequence number.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestClock {
    entries: BTreeMap<ProcessId, u64>,
}

impl RequestClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `id`, 0 if absent.
    pub fn get(&self, id: ProcessId) -> u64 {
        self.entries.get(&id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, id: ProcessId, value: u64) {
        self.entries.insert(id, value);
    }

    /// Increment the counter for `id` (absent treated as 0) and return the new value.
    pub fn increment(&mut self, id: ProcessId) -> u64 {
        let counter = self.entries.entry(id).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Insert a 0 entry for `id` unless one exists. Returns true if inserted.
    pub fn insert_if_absent(&mut self, id: ProcessId) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, 0);
        true
    }

    pub fn remove(&mut self, id: ProcessId) -> Option<u64> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending process ID order.
    pub fn iter(&self) -> impl Iterator<Item = (ProcessId, u64)> + '_ {
        self.entries.iter().map(|(id, value)| (*id, *value))
    }

    /// Compare elementwise over the union of keys, missing entries as 0.
    pub fn compare(&self, other: &RequestClock) -> ClockOrdering {
        let mut greater = false;
        let mut smaller = false;

        for id in self.entries.keys().chain(other.entries.keys()) {
            match self.get(*id).cmp(&other.get(*id)) {
                Ordering::Greater => greater = true,
                Ordering::Less => smaller = true,
                Ordering::Equal => {}
            }
            if greater && smaller {
                return ClockOrdering::Simultaneous;
            }
        }

        match (greater, smaller) {
            (true, false) => ClockOrdering::Greater,
            (false, true) => ClockOrdering::Smaller,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Simultaneous,
        }
    }
}

// A zero entry and a missing entry are the same clock.
impl PartialEq for RequestClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Equal
    }
}

impl Eq for RequestClock {}

impl PartialOrd for RequestClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.compare(other) {
            ClockOrdering::Greater => Some(Ordering::Greater),
            ClockOrdering::Smaller => Some(Ordering::Less),
            ClockOrdering::Equal => Some(Ordering::Equal),
            ClockOrdering::Simultaneous => None,
        }
    }
}

impl FromIterator<(ProcessId, u64)> for RequestClock {
    fn from_iter<I: IntoIterator<Item = (ProcessId, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl Display for RequestClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (id, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}: {value}")?;
        }
        write!(f, "}}")
    }
}
