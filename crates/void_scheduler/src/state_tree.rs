//! Hierarchical Pipeline State
//!
//! Every scene node may override a subset of slots; everything else is
//! inherited from the nearest ancestor that defines it. The tree owns all
//! nodes and override values in arenas; parent/child links and cached
//! bindings are plain handles.
//!
//! # Edit Cycle
//!
//! Edits are staged with [`StateTree::define`] / [`StateTree::undefine`] and
//! applied by [`StateTree::commit`]. Reads only ever see committed state.
//!
//! # Invalidation
//!
//! Each override owns a [`ValueId`]. On commit:
//!
//! - redefining an existing override keeps its `ValueId`; only nodes that
//!   registered a read of that value are reported
//! - adding an override for a slot undefined along the path marks the whole
//!   subtree stale
//! - adding a shadowing override or removing one rebinds that single slot,
//!   skipping branches that define the slot themselves
//!
//! Reads are registered by [`StateTree::snapshot`]; those registrations form
//! the reverse-dependency lists reported in [`CommitReport`].

use std::collections::{BTreeSet, HashMap};

use void_core::{Arena, Handle, HandleError};

use crate::schema::{SlotId, StateValue};
use crate::error::StateError;

/// Handle to a node of the state tree
pub type NodeId = Handle<StateNode>;

/// Identity of one committed override value
pub type ValueId = Handle<ValueCell>;

/// A committed override value
#[derive(Clone, Debug)]
pub struct ValueCell {
    node: NodeId,
    slot: SlotId,
    value: StateValue,
}

impl ValueCell {
    /// Node that owns the override
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Overridden slot
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Current value
    pub fn value(&self) -> &StateValue {
        &self.value
    }
}

/// A staged state edit
#[derive(Clone, Debug, PartialEq)]
pub enum StateOp {
    /// Override a slot on the node
    Define(SlotId, StateValue),
    /// Drop the node's override of a slot
    Undefine(SlotId),
}

impl StateOp {
    /// Slot the edit touches
    pub fn slot(&self) -> SlotId {
        match self {
            Self::Define(slot, _) | Self::Undefine(slot) => *slot,
        }
    }
}

/// A node of the state tree
#[derive(Debug)]
pub struct StateNode {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Local overrides, sorted by slot
    overrides: Vec<(SlotId, ValueId)>,
    pending: Vec<StateOp>,
    /// Cached effective bindings, valid while `stale` is false
    effective: Box<[Option<ValueId>]>,
    stale: bool,
    /// Values this node registered reads of at its last snapshot
    reads: Vec<ValueId>,
    /// Snapshotted since creation or the last `forget_reads`
    observed: bool,
}

impl StateNode {
    fn new(parent: Option<NodeId>, slot_count: usize) -> Self {
        Self {
            parent,
            children: Vec::new(),
            overrides: Vec::new(),
            pending: Vec::new(),
            effective: vec![None; slot_count].into_boxed_slice(),
            stale: true,
            reads: Vec::new(),
            observed: false,
        }
    }

    fn local(&self, slot: SlotId) -> Option<ValueId> {
        self.overrides
            .binary_search_by_key(&slot, |(s, _)| *s)
            .ok()
            .map(|i| self.overrides[i].1)
    }
}

/// Resolved effective state of a node at one point in time
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    bindings: Box<[Option<ValueId>]>,
    values: Box<[Option<StateValue>]>,
}

impl StateSnapshot {
    /// Number of slots covered
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the snapshot covers no slots
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Identity of the override that supplies `slot`
    pub fn binding(&self, slot: SlotId) -> Option<ValueId> {
        self.bindings.get(slot.index()).copied().flatten()
    }

    /// Effective value of `slot`, `None` if undefined
    pub fn value(&self, slot: SlotId) -> Option<&StateValue> {
        self.values.get(slot.index()).and_then(Option::as_ref)
    }

    /// Iterate over defined slots
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &StateValue)> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (SlotId(i as u16), v)))
    }

    /// Check that two snapshots bind `slots` to the same overrides
    pub fn same_bindings(&self, other: &Self, slots: &[SlotId]) -> bool {
        slots.iter().all(|s| self.binding(*s) == other.binding(*s))
    }
}

/// An in-place value change and the nodes that read it
#[derive(Clone, Debug, PartialEq)]
pub struct ValueChange {
    /// The redefined value
    pub value: ValueId,
    /// Nodes whose last snapshot bound the value
    pub readers: Vec<NodeId>,
}

/// Outcome of [`StateTree::commit`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommitReport {
    /// Overrides whose value changed in place
    pub changed: Vec<ValueChange>,
    /// Snapshotted nodes whose bindings may have moved
    pub rebound: Vec<NodeId>,
}

impl CommitReport {
    /// Check if the commit affected nobody
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.rebound.is_empty()
    }

    /// Every node that must re-read its state, sorted and deduplicated
    pub fn affected(&self) -> Vec<NodeId> {
        let mut nodes: BTreeSet<NodeId> = self.rebound.iter().copied().collect();
        for change in &self.changed {
            nodes.extend(change.readers.iter().copied());
        }
        nodes.into_iter().collect()
    }
}

/// Arena-backed state inheritance tree
#[derive(Debug)]
pub struct StateTree {
    slot_count: usize,
    nodes: Arena<StateNode>,
    values: Arena<ValueCell>,
    readers: HashMap<ValueId, BTreeSet<NodeId>>,
}

impl StateTree {
    /// Create an empty tree for `slot_count` slots
    pub fn new(slot_count: usize) -> Self {
        Self {
            slot_count,
            nodes: Arena::new(),
            values: Arena::new(),
            readers: HashMap::new(),
        }
    }

    /// Number of slots per node
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the tree has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check if a node is live
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(node)
    }

    /// Create a node under `parent` (or a new root)
    pub fn insert_node(&mut self, parent: Option<NodeId>) -> Result<NodeId, StateError> {
        if let Some(p) = parent {
            self.nodes.try_get(p)?;
        }
        let id = self.nodes.insert(StateNode::new(parent, self.slot_count));
        if let Some(p) = parent {
            self.nodes[p].children.push(id);
        }
        Ok(id)
    }

    /// Parent of a node
    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>, StateError> {
        Ok(self.nodes.try_get(node)?.parent)
    }

    /// Children of a node
    pub fn children(&self, node: NodeId) -> Result<&[NodeId], StateError> {
        Ok(&self.nodes.try_get(node)?.children)
    }

    /// The node and all its descendants, parents before children
    pub fn subtree(&self, node: NodeId) -> Result<Vec<NodeId>, StateError> {
        self.nodes.try_get(node)?;
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.nodes[id].children.iter().rev().copied());
        }
        Ok(out)
    }

    /// Destroy a node with its whole subtree, returning the destroyed ids
    pub fn destroy_node(&mut self, node: NodeId) -> Result<Vec<NodeId>, StateError> {
        let doomed = self.subtree(node)?;

        if let Some(parent) = self.nodes[node].parent {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.retain(|c| *c != node);
            }
        }

        for id in &doomed {
            self.forget_reads(*id);
            if let Some(state) = self.nodes.remove(*id) {
                for (_, vid) in state.overrides {
                    self.values.remove(vid);
                    self.readers.remove(&vid);
                }
            }
        }

        log::trace!("State tree: destroyed {} nodes under {:?}", doomed.len(), node);
        Ok(doomed)
    }

    fn check_slot(&self, slot: SlotId) -> Result<(), StateError> {
        if slot.index() < self.slot_count {
            Ok(())
        } else {
            Err(StateError::UnknownSlot(slot))
        }
    }

    /// Stage an override of `slot` on `node`
    pub fn define(&mut self, node: NodeId, slot: SlotId, value: StateValue) -> Result<(), StateError> {
        self.stage(node, core::iter::once(StateOp::Define(slot, value)))
    }

    /// Stage removal of `node`'s override of `slot`
    pub fn undefine(&mut self, node: NodeId, slot: SlotId) -> Result<(), StateError> {
        self.stage(node, core::iter::once(StateOp::Undefine(slot)))
    }

    /// Stage a batch of edits
    pub fn stage(
        &mut self,
        node: NodeId,
        ops: impl IntoIterator<Item = StateOp>,
    ) -> Result<(), StateError> {
        self.nodes.try_get(node)?;
        let ops: Vec<StateOp> = ops.into_iter().collect();
        for op in &ops {
            self.check_slot(op.slot())?;
        }
        self.nodes[node].pending.extend(ops);
        Ok(())
    }

    /// Check if a node has staged edits
    pub fn has_pending(&self, node: NodeId) -> bool {
        self.nodes.get(node).map_or(false, |n| !n.pending.is_empty())
    }

    /// Apply staged edits of `node`
    pub fn commit(&mut self, node: NodeId) -> Result<CommitReport, StateError> {
        let pending = core::mem::take(&mut self.nodes.try_get_mut(node)?.pending);
        let mut report = CommitReport::default();

        for op in pending {
            match op {
                StateOp::Define(slot, value) => {
                    if let Some(vid) = self.nodes[node].local(slot) {
                        let cell = &mut self.values[vid];
                        if cell.value == value {
                            continue;
                        }
                        cell.value = value;
                        if !report.changed.iter().any(|c| c.value == vid) {
                            let readers = self
                                .readers
                                .get(&vid)
                                .map(|r| r.iter().copied().collect())
                                .unwrap_or_default();
                            report.changed.push(ValueChange { value: vid, readers });
                        }
                        continue;
                    }

                    let inherited = self.inherited(node, slot);
                    let vid = self.values.insert(ValueCell { node, slot, value });
                    let overrides = &mut self.nodes[node].overrides;
                    let at = overrides.partition_point(|(s, _)| *s < slot);
                    overrides.insert(at, (slot, vid));

                    if inherited.is_none() && !self.nodes[node].children.is_empty() {
                        self.mark_subtree_stale(node, &mut report.rebound);
                    } else {
                        self.rebind_slot(node, slot, Some(vid), &mut report.rebound);
                    }
                }
                StateOp::Undefine(slot) => {
                    let overrides = &mut self.nodes[node].overrides;
                    let Ok(at) = overrides.binary_search_by_key(&slot, |(s, _)| *s) else {
                        continue;
                    };
                    let (_, vid) = overrides.remove(at);
                    self.values.remove(vid);
                    self.readers.remove(&vid);
                    report.changed.retain(|c| c.value != vid);

                    let inherited = self.inherited(node, slot);
                    self.rebind_slot(node, slot, inherited, &mut report.rebound);
                }
            }
        }

        report.rebound.sort();
        report.rebound.dedup();
        Ok(report)
    }

    /// Nearest override of `slot` strictly above `node`
    fn inherited(&self, node: NodeId, slot: SlotId) -> Option<ValueId> {
        let mut cursor = self.nodes[node].parent;
        while let Some(id) = cursor {
            let n = &self.nodes[id];
            if let Some(vid) = n.local(slot) {
                return Some(vid);
            }
            cursor = n.parent;
        }
        None
    }

    fn mark_subtree_stale(&mut self, root: NodeId, rebound: &mut Vec<NodeId>) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let n = &mut self.nodes[id];
            n.stale = true;
            if n.observed {
                rebound.push(id);
            }
            stack.extend(n.children.iter().copied());
        }
    }

    /// Point `slot` at `binding` for `root` and every descendant that inherits it
    fn rebind_slot(
        &mut self,
        root: NodeId,
        slot: SlotId,
        binding: Option<ValueId>,
        rebound: &mut Vec<NodeId>,
    ) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let n = &mut self.nodes[id];
            let moved = if n.stale {
                true
            } else {
                let cached = &mut n.effective[slot.index()];
                let moved = *cached != binding;
                *cached = binding;
                moved
            };
            if moved && n.observed {
                rebound.push(id);
            }
            let children = n.children.clone();
            for child in children {
                if self.nodes[child].local(slot).is_none() {
                    stack.push(child);
                }
            }
        }
    }

    /// Refresh cached bindings of `node` and any stale ancestors
    fn resolve(&mut self, node: NodeId) {
        let mut chain = Vec::new();
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            let n = &self.nodes[id];
            if !n.stale {
                break;
            }
            chain.push(id);
            cursor = n.parent;
        }

        for id in chain.into_iter().rev() {
            let mut effective = match self.nodes[id].parent {
                Some(p) => self.nodes[p].effective.clone(),
                None => vec![None; self.slot_count].into_boxed_slice(),
            };
            let n = &mut self.nodes[id];
            for (slot, vid) in &n.overrides {
                effective[slot.index()] = Some(*vid);
            }
            n.effective = effective;
            n.stale = false;
        }
    }

    /// Effective value of `slot` at `node`, `None` if undefined
    pub fn get(&self, node: NodeId, slot: SlotId) -> Result<Option<&StateValue>, StateError> {
        self.check_slot(slot)?;
        let n = self.nodes.try_get(node)?;
        let binding = if n.stale {
            n.local(slot).or_else(|| self.inherited(node, slot))
        } else {
            n.effective[slot.index()]
        };
        Ok(binding.and_then(|vid| self.value(vid)))
    }

    /// Resolve the full effective state of `node` and register it as a
    /// reader of every bound value
    pub fn snapshot(&mut self, node: NodeId) -> Result<StateSnapshot, StateError> {
        self.nodes.try_get(node)?;
        self.resolve(node);
        self.forget_reads(node);

        let bindings = self.nodes[node].effective.clone();
        let mut reads = Vec::new();
        let values = bindings
            .iter()
            .map(|binding| {
                binding.map(|vid| {
                    self.readers.entry(vid).or_default().insert(node);
                    reads.push(vid);
                    self.values[vid].value.clone()
                })
            })
            .collect();
        let n = &mut self.nodes[node];
        n.reads = reads;
        n.observed = true;

        Ok(StateSnapshot { bindings, values })
    }

    /// Drop every read registration of `node`
    pub fn forget_reads(&mut self, node: NodeId) {
        let Some(n) = self.nodes.get_mut(node) else {
            return;
        };
        n.observed = false;
        for vid in core::mem::take(&mut n.reads) {
            if let Some(readers) = self.readers.get_mut(&vid) {
                readers.remove(&node);
                if readers.is_empty() {
                    self.readers.remove(&vid);
                }
            }
        }
    }

    /// Current value of an override
    pub fn value(&self, value: ValueId) -> Option<&StateValue> {
        self.values.get(value).map(|c| &c.value)
    }

    /// Look up an override cell
    pub fn cell(&self, value: ValueId) -> Result<&ValueCell, HandleError> {
        self.values.try_get(value)
    }

    /// Nodes registered as readers of `value`
    pub fn readers(&self, value: ValueId) -> impl Iterator<Item = NodeId> + '_ {
        self.readers.get(&value).into_iter().flatten().copied()
    }

    /// Local overrides of a node
    pub fn overrides(&self, node: NodeId) -> Result<impl Iterator<Item = (SlotId, &StateValue)> + '_, StateError> {
        let n = self.nodes.try_get(node)?;
        Ok(n.overrides.iter().map(|(slot, vid)| (*slot, &self.values[*vid].value)))
    }
}
