//! The server-provided locomotive roster.
//!
//! The roster is a bounded, ordered snapshot. It is never edited in place
//! by the controller; a fresh roster message from the server replaces it
//! wholesale, and any index remembered from the previous snapshot is
//! meaningless afterwards.

use heapless::Vec as HVec;
use serde::{Deserialize, Serialize};

use crate::locomotive::{AddressType, LocoAddress, Locomotive};

/// Maximum number of roster entries kept.
pub const MAX_ROSTER_ENTRIES: usize = 50;

/// One locomotive descriptor as announced by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Display name.
    pub name: String,
    /// DCC address and length class.
    pub address: LocoAddress,
}

impl RosterEntry {
    /// Creates a roster entry.
    pub fn new(name: impl Into<String>, number: u16, kind: AddressType) -> Self {
        Self {
            name: name.into(),
            address: LocoAddress::new(number, kind),
        }
    }

    /// Builds a fresh, stopped locomotive from this descriptor.
    pub fn to_locomotive(&self) -> Locomotive {
        Locomotive::new(self.name.clone(), self.address)
    }
}

/// Bounded roster snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Roster {
    entries: HVec<RosterEntry, MAX_ROSTER_ENTRIES>,
}

impl Roster {
    /// Creates an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a roster from entries, keeping at most [`MAX_ROSTER_ENTRIES`].
    /// Returns the roster and the number of entries that did not fit.
    pub fn from_entries(entries: impl IntoIterator<Item = RosterEntry>) -> (Self, usize) {
        let mut roster = Self::new();
        let mut dropped = 0;
        for entry in entries {
            if roster.push(entry).is_err() {
                dropped += 1;
            }
        }
        (roster, dropped)
    }

    /// Appends an entry, handing it back if the roster is full.
    pub fn push(&mut self, entry: RosterEntry) -> Result<(), RosterEntry> {
        self.entries.push(entry)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the roster has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `index`.
    pub fn get(&self, index: usize) -> Option<&RosterEntry> {
        self.entries.get(index)
    }

    /// All entries in server order.
    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    /// Iterates entries in server order.
    pub fn iter(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.iter()
    }

    /// Moves `index` by `delta` positions, wrapping in both directions.
    /// Returns `None` when the roster is empty.
    pub fn wrap_index(&self, index: usize, delta: i32) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let len = self.entries.len() as i64;
        let moved = (index as i64 + i64::from(delta)).rem_euclid(len);
        Some(moved as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Roster {
        Roster::from_entries([
            RosterEntry::new("LocoA", 3, AddressType::Short),
            RosterEntry::new("LocoB", 40, AddressType::Long),
            RosterEntry::new("LocoC", 1234, AddressType::Long),
        ])
        .0
    }

    #[test]
    fn test_wrap_index() {
        let roster = sample();
        assert_eq!(roster.wrap_index(0, 1), Some(1));
        assert_eq!(roster.wrap_index(2, 1), Some(0));
        assert_eq!(roster.wrap_index(0, -1), Some(2));
        assert_eq!(roster.wrap_index(1, -7), Some(0));
        assert_eq!(Roster::new().wrap_index(0, 3), None);
    }

    #[test]
    fn test_bounded() {
        let entries = (0..60).map(|i| RosterEntry::new(format!("L{i}"), i, AddressType::Short));
        let (roster, dropped) = Roster::from_entries(entries);
        assert_eq!(roster.len(), MAX_ROSTER_ENTRIES);
        assert_eq!(dropped, 10);
        assert_eq!(roster.get(49).unwrap().name, "L49");
    }
}
