//! Instance Batching System
//!
//! Detects draws that differ only in instanced slots and folds them into
//! one instanced draw. Each batch key owns at most one order-index entry:
//!
//! - one member: a bare entry for that node
//! - two or more: a group entry plus an [`InstanceBuffer`] holding one row
//!   per member
//!
//! The batcher decides; it does not touch the order index. Every call
//! returns the [`BatchAction`]s the caller must apply, in order.
//!
//! # Usage
//!
//! ```ignore
//! let mut batcher = InstanceBatcher::new(stride, 4, true);
//!
//! for action in batcher.add(node, key, row) {
//!     match action {
//!         BatchAction::InsertBare(node) => { /* build and insert a bare entry */ }
//!         BatchAction::InsertGroup(group) => { /* build from the representative */ }
//!         _ => { /* ... */ }
//!     }
//! }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use void_core::{Arena, Handle};

use crate::error::invariant_violation;
use crate::instancing::{BatchKey, InstanceBuffer};
use crate::state_tree::NodeId;

/// Handle to an instance group
pub type GroupId = Handle<InstanceGroup>;

/// Order-index change requested by the batcher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchAction {
    /// Insert a bare entry for the node
    InsertBare(NodeId),
    /// Remove the node's bare entry
    RemoveBare(NodeId),
    /// Re-derive the node's bare entry in place; its key changed but it
    /// still draws alone
    RekeyBare(NodeId),
    /// Insert the group's entry, derived from its representative
    InsertGroup(GroupId),
    /// Remove the group's entry
    RemoveGroup(GroupId),
    /// The group's representative changed; re-derive its entry
    Rebase(GroupId),
}

/// A set of draws merged into one instanced call
#[derive(Debug)]
pub struct InstanceGroup {
    key: BatchKey,
    members: Vec<NodeId>,
    buffer: InstanceBuffer,
}

impl InstanceGroup {
    /// Shared batch key
    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    /// Members, in buffer row order
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Member whose state the group entry is derived from
    pub fn representative(&self) -> NodeId {
        self.members[0]
    }

    /// Number of instances
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false for a live group
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Per-instance rows
    pub fn buffer(&self) -> &InstanceBuffer {
        &self.buffer
    }
}

#[derive(Clone, Debug)]
enum KeySlot {
    Bare(NodeId),
    Group(GroupId),
}

#[derive(Clone, Debug)]
struct Membership {
    key: BatchKey,
    group: Option<GroupId>,
    /// Row index inside the group's buffer
    row: usize,
    /// Instance row kept while the node draws alone
    bare_row: Vec<f32>,
}

/// Batching statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatcherStats {
    /// Live groups
    pub groups: usize,
    /// Nodes drawn through a group
    pub grouped_members: usize,
    /// Nodes drawn alone
    pub bare_entries: usize,
    /// Floats allocated across group buffers
    pub buffer_floats: usize,
}

/// Online instance grouping
#[derive(Debug)]
pub struct InstanceBatcher {
    slots: HashMap<BatchKey, KeySlot>,
    groups: Arena<InstanceGroup>,
    members: HashMap<NodeId, Membership>,
    stride: usize,
    initial_capacity: usize,
    enabled: bool,
}

impl InstanceBatcher {
    /// Create a batcher for rows of `stride` floats
    pub fn new(stride: usize, initial_capacity: usize, enabled: bool) -> Self {
        Self {
            slots: HashMap::new(),
            groups: Arena::new(),
            members: HashMap::new(),
            stride,
            initial_capacity,
            enabled,
        }
    }

    /// Whether groups are formed
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Forget every node and group, switching grouping on or off
    pub fn reset(&mut self, enabled: bool) {
        self.slots.clear();
        self.groups.clear();
        self.members.clear();
        self.enabled = enabled;
    }

    /// Register a drawable node
    pub fn add(&mut self, node: NodeId, key: BatchKey, row: Vec<f32>) -> Vec<BatchAction> {
        if self.members.contains_key(&node) {
            invariant_violation!("Instance batcher: {:?} added twice", node);
        }

        let slot = if self.enabled { self.slots.get(&key).cloned() } else { None };

        match slot {
            None => {
                if self.enabled {
                    self.slots.insert(key.clone(), KeySlot::Bare(node));
                }
                self.members.insert(node, Membership { key, group: None, row: 0, bare_row: row });
                vec![BatchAction::InsertBare(node)]
            }
            Some(KeySlot::Bare(other)) => {
                let Some(first) = self.members.get_mut(&other) else {
                    invariant_violation!("Instance batcher: bare slot names unknown {:?}", other);
                };
                let mut buffer = InstanceBuffer::new(self.stride, self.initial_capacity);
                buffer.push(&first.bare_row);
                buffer.push(&row);
                first.bare_row = Vec::new();

                let group = self.groups.insert(InstanceGroup {
                    key: key.clone(),
                    members: vec![other, node],
                    buffer,
                });
                first.group = Some(group);
                first.row = 0;
                self.members.insert(node, Membership { key: key.clone(), group: Some(group), row: 1, bare_row: Vec::new() });
                self.slots.insert(key, KeySlot::Group(group));

                log::debug!("Instance batcher: formed {:?} from {:?} and {:?}", group, other, node);
                vec![BatchAction::RemoveBare(other), BatchAction::InsertGroup(group)]
            }
            Some(KeySlot::Group(group)) => {
                let g = &mut self.groups[group];
                let row_index = g.buffer.push(&row);
                g.members.push(node);
                self.members.insert(node, Membership { key, group: Some(group), row: row_index, bare_row: Vec::new() });
                log::trace!("Instance batcher: {:?} joined {:?} ({} members)", node, group, g.members.len());
                Vec::new()
            }
        }
    }

    /// Unregister a drawable node
    pub fn remove(&mut self, node: NodeId) -> Vec<BatchAction> {
        let Some(membership) = self.members.remove(&node) else {
            invariant_violation!("Instance batcher: removing non-member {:?}", node);
        };

        let Some(group) = membership.group else {
            if matches!(self.slots.get(&membership.key), Some(KeySlot::Bare(n)) if *n == node) {
                self.slots.remove(&membership.key);
            }
            return vec![BatchAction::RemoveBare(node)];
        };

        let g = &mut self.groups[group];
        let row = membership.row;
        g.members.swap_remove(row);
        g.buffer.swap_remove(row);
        if let Some(moved) = g.members.get(row).copied() {
            if let Some(m) = self.members.get_mut(&moved) {
                m.row = row;
            }
        }

        if g.members.len() == 1 {
            let last = g.members[0];
            let bare_row = g.buffer.row(0).map(<[f32]>::to_vec).unwrap_or_default();
            self.groups.remove(group);
            if let Some(m) = self.members.get_mut(&last) {
                m.group = None;
                m.row = 0;
                m.bare_row = bare_row;
            }
            self.slots.insert(membership.key, KeySlot::Bare(last));
            log::debug!("Instance batcher: dissolved {:?}, {:?} draws alone", group, last);
            return vec![BatchAction::RemoveGroup(group), BatchAction::InsertBare(last)];
        }

        if row == 0 {
            vec![BatchAction::Rebase(group)]
        } else {
            Vec::new()
        }
    }

    /// Re-register a node whose state changed
    ///
    /// A new row under the same key only refills the node's instance row.
    /// A new key moves the node through the remove and add paths, except
    /// for a lone node whose new key has no partner, which is rekeyed.
    pub fn update(&mut self, node: NodeId, key: BatchKey, row: Vec<f32>) -> Vec<BatchAction> {
        let Some(membership) = self.members.get_mut(&node) else {
            invariant_violation!("Instance batcher: updating non-member {:?}", node);
        };

        if membership.key == key {
            match membership.group {
                Some(group) => self.groups[group].buffer.write(membership.row, &row),
                None => membership.bare_row = row,
            }
            return Vec::new();
        }

        let lone = membership.group.is_none();
        if lone && (!self.enabled || !self.slots.contains_key(&key)) {
            let old = core::mem::replace(&mut membership.key, key.clone());
            membership.bare_row = row;
            if self.enabled {
                self.slots.remove(&old);
                self.slots.insert(key, KeySlot::Bare(node));
            }
            return vec![BatchAction::RekeyBare(node)];
        }

        let mut actions = self.remove(node);
        actions.extend(self.add(node, key, row));
        actions
    }

    /// Forget a node whose bare entry could not be built
    pub fn evict(&mut self, node: NodeId) {
        let Some(membership) = self.members.remove(&node) else {
            return;
        };
        if membership.group.is_some() {
            invariant_violation!("Instance batcher: evicting grouped {:?} alone", node);
        }
        if matches!(self.slots.get(&membership.key), Some(KeySlot::Bare(n)) if *n == node) {
            self.slots.remove(&membership.key);
        }
    }

    /// Forget a group whose entry could not be built, returning its members
    pub fn evict_group(&mut self, group: GroupId) -> Vec<NodeId> {
        let Some(g) = self.groups.remove(group) else {
            return Vec::new();
        };
        self.slots.remove(&g.key);
        for member in &g.members {
            self.members.remove(member);
        }
        log::debug!("Instance batcher: evicted {:?} with {} members", group, g.members.len());
        g.members
    }

    /// Look up a group
    pub fn group(&self, group: GroupId) -> Option<&InstanceGroup> {
        self.groups.get(group)
    }

    /// Group a node is drawn through, if any
    pub fn group_of(&self, node: NodeId) -> Option<GroupId> {
        self.members.get(&node).and_then(|m| m.group)
    }

    /// Representative of a group
    pub fn representative(&self, group: GroupId) -> Option<NodeId> {
        self.groups.get(group).map(InstanceGroup::representative)
    }

    /// Check if a node is registered
    pub fn is_member(&self, node: NodeId) -> bool {
        self.members.contains_key(&node)
    }

    /// Batch key a node is registered under
    pub fn key_of(&self, node: NodeId) -> Option<&BatchKey> {
        self.members.get(&node).map(|m| &m.key)
    }

    /// Instance row of a node
    pub fn row_of(&self, node: NodeId) -> Option<&[f32]> {
        let m = self.members.get(&node)?;
        match m.group {
            Some(group) => self.groups.get(group)?.buffer.row(m.row),
            None => Some(&m.bare_row),
        }
    }

    /// Iterate over live groups
    pub fn groups(&self) -> impl Iterator<Item = (GroupId, &InstanceGroup)> {
        self.groups.iter()
    }

    /// Current statistics
    pub fn stats(&self) -> BatcherStats {
        let grouped_members: usize = self.groups.values().map(InstanceGroup::len).sum();
        BatcherStats {
            groups: self.groups.len(),
            grouped_members,
            bare_entries: self.members.len() - grouped_members,
            buffer_floats: self.groups.values().map(|g| g.buffer.allocated_floats()).sum(),
        }
    }
}
