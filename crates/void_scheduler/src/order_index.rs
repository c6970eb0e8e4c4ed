//! Order Index
//!
//! Keeps every live entry in one total order. Entries are owned by an arena;
//! the order itself is a `BTreeMap` from [`SortKey`] to entry handle, giving
//! logarithmic insert, remove and neighbor lookup with stable in-order
//! iteration.
//!
//! Every insert stamps the key with a fresh sequence number, so no two live
//! keys compare equal. A collision therefore means the index is corrupt and
//! is treated as an invariant violation.

use std::collections::BTreeMap;
use std::ops::Bound;

use void_core::{Arena, Handle};

use crate::entry::{Entry, SortKey};
use crate::error::invariant_violation;

/// Handle to an entry in the index
pub type EntryId = Handle<Entry>;

/// Ordered set of draw entries
#[derive(Debug, Default)]
pub struct OrderIndex {
    entries: Arena<Entry>,
    order: BTreeMap<SortKey, EntryId>,
    next_sequence: u64,
}

impl OrderIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arena::with_capacity(capacity),
            ..Self::default()
        }
    }

    fn stamp(&mut self, key: &mut SortKey) {
        key.sequence = self.next_sequence;
        self.next_sequence += 1;
    }

    /// Insert an entry, assigning its tie-break
    pub fn insert(&mut self, mut entry: Entry) -> EntryId {
        self.stamp(&mut entry.key);
        let key = entry.key;
        let id = self.entries.insert(entry);
        if let Some(other) = self.order.insert(key, id) {
            invariant_violation!(
                "Order index: key {:?} of {:?} collides with {:?}",
                key,
                id,
                other
            );
        }
        log::trace!("Order index: inserted {:?} at {:?}", id, key);
        id
    }

    /// Remove an entry and hand it back
    pub fn remove(&mut self, id: EntryId) -> Entry {
        let Some(entry) = self.entries.remove(id) else {
            invariant_violation!("Order index: remove of unknown entry {:?}", id);
        };
        if self.order.remove(&entry.key) != Some(id) {
            invariant_violation!("Order index: {:?} missing from order at {:?}", id, entry.key);
        }
        log::trace!("Order index: removed {:?}", id);
        entry
    }

    /// Move an entry to `key`
    ///
    /// The position is left untouched when only the tie-break would differ.
    /// Returns whether the entry moved.
    pub fn rekey(&mut self, id: EntryId, mut key: SortKey) -> bool {
        let Some(entry) = self.entries.get(id) else {
            invariant_violation!("Order index: rekey of unknown entry {:?}", id);
        };
        let old = entry.key;
        if old.same_order(&key) {
            return false;
        }

        self.order.remove(&old);
        self.stamp(&mut key);
        self.entries[id].key = key;
        if let Some(other) = self.order.insert(key, id) {
            invariant_violation!("Order index: rekeyed {:?} collides with {:?}", id, other);
        }
        true
    }

    /// Previous and next entries in walk order
    pub fn neighbors(&self, id: EntryId) -> (Option<EntryId>, Option<EntryId>) {
        let Some(entry) = self.entries.get(id) else {
            return (None, None);
        };
        let key = entry.key;
        let prev = self.order.range(..key).next_back().map(|(_, id)| *id);
        let next = self
            .order
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, id)| *id);
        (prev, next)
    }

    /// Entries in walk order
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &Entry)> {
        self.order.values().map(move |id| (*id, &self.entries[*id]))
    }

    /// First entry in walk order
    pub fn first(&self) -> Option<EntryId> {
        self.order.values().next().copied()
    }

    /// Look up an entry
    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(id)
    }

    /// Look up an entry mutably; the key must be changed through [`Self::rekey`]
    pub(crate) fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.entries.get_mut(id)
    }

    /// Check if an entry is live
    pub fn contains(&self, id: EntryId) -> bool {
        self.entries.contains(id)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
