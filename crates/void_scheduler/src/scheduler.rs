//! Render Command Scheduler
//!
//! The façade the scene graph talks to. It owns the state tree, the setting
//! cache, the order index, the instance batcher and the submission state,
//! and routes every inbound call through them:
//!
//! ```text
//! add/update/remove ──► StateTree::commit ──► SettingCache::notify
//!                                   │
//!                                   ▼
//!                     re-derive affected drawables
//!                                   │
//!                                   ▼
//!                InstanceBatcher ──► BatchActions ──► OrderIndex
//!
//! emit ──► Submission walks OrderIndex ──► Backend
//! ```
//!
//! # Failures
//!
//! A node whose program cannot be resolved or whose settings cannot be
//! compiled stays registered but is left out of the order index. The error
//! is returned to the caller and kept until [`Scheduler::retry_failed`] or a
//! later update of the node succeeds.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, FragmentCompiler, ProgramId, ProgramResolver};
use crate::config::{SchedulerConfig, SchedulerState};
use crate::draw_command::{DrawCommand, FrameReport};
use crate::entry::{Entry, EntrySource, SortKey};
use crate::error::{invariant_violation, CompileError, ConfigError, ScheduleError, SchemaError};
use crate::handoff::StateHandoff;
use crate::instance_batcher::{BatchAction, BatcherStats, GroupId, InstanceBatcher};
use crate::instancing::{instance_row, BatchKey};
use crate::order_index::{EntryId, OrderIndex};
use crate::schema::{SlotId, SlotSchema, StateValue};
use crate::setting_cache::{CacheStats, SettingCache, SettingId, SettingKind, SettingRef};
use crate::state_tree::{CommitReport, NodeId, StateOp, StateSnapshot, StateTree, ValueId};
use crate::submission::Submission;

/// Scheduler-wide counters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Frames emitted
    pub frame: u64,
    /// Live state tree nodes
    pub nodes: usize,
    /// Nodes registered as drawable
    pub drawables: usize,
    /// Entries in the order index
    pub entries: usize,
    /// Drawables currently left out of the frame
    pub failed: usize,
    /// Setting cache counters
    pub cache: CacheStats,
    /// Batching counters
    pub batcher: BatcherStats,
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries, {} live settings, {} instance groups, {} failed",
            self.entries, self.cache.live_settings, self.batcher.groups, self.failed
        )
    }
}

/// Cached derivation of a drawable
#[derive(Debug, Default)]
struct Drawable {
    snapshot: Option<StateSnapshot>,
    /// Program inputs and the program they resolved to
    program: Option<(Box<[Option<StateValue>]>, ProgramId)>,
}

struct Derived {
    snapshot: StateSnapshot,
    inputs: Box<[Option<StateValue>]>,
    program: ProgramId,
    key: BatchKey,
    row: Vec<f32>,
}

enum Refresh {
    Withdraw(NodeId),
    Resettle {
        node: NodeId,
        old: Option<StateSnapshot>,
        key: BatchKey,
        row: Vec<f32>,
    },
}

/// Incremental render command scheduler
pub struct Scheduler<R: ProgramResolver, C: FragmentCompiler> {
    config: SchedulerConfig,
    schema: SlotSchema,
    tree: StateTree,
    cache: SettingCache,
    order: OrderIndex,
    batcher: InstanceBatcher,
    submission: Submission,
    drawables: BTreeMap<NodeId, Drawable>,
    bare: HashMap<NodeId, EntryId>,
    grouped: HashMap<GroupId, EntryId>,
    failed: BTreeMap<NodeId, ScheduleError>,
    resolver: R,
    compiler: C,
    frame: u64,
}

fn first_error(errors: Vec<ScheduleError>) -> Result<(), ScheduleError> {
    match errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

impl<R: ProgramResolver, C: FragmentCompiler> Scheduler<R, C> {
    /// Create a scheduler with the given configuration
    pub fn new(
        schema: SlotSchema,
        resolver: R,
        compiler: C,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(schema, resolver, compiler, config))
    }

    /// Create a scheduler with the default configuration
    pub fn with_defaults(schema: SlotSchema, resolver: R, compiler: C) -> Self {
        Self::build(schema, resolver, compiler, SchedulerConfig::default())
    }

    fn build(schema: SlotSchema, resolver: R, compiler: C, config: SchedulerConfig) -> Self {
        let batcher = InstanceBatcher::new(
            schema.instance_stride(),
            config.initial_instance_capacity,
            config.instancing,
        );
        Self {
            tree: StateTree::new(schema.len()),
            cache: SettingCache::new(),
            order: OrderIndex::with_capacity(config.initial_entry_capacity),
            batcher,
            submission: Submission::new(),
            drawables: BTreeMap::new(),
            bare: HashMap::new(),
            grouped: HashMap::new(),
            failed: BTreeMap::new(),
            resolver,
            compiler,
            frame: 0,
            schema,
            config,
        }
    }

    // ---- Scene graph surface ----

    /// Create a state node under `parent` (or a new root)
    pub fn create_node(&mut self, parent: Option<NodeId>) -> Result<NodeId, ScheduleError> {
        Ok(self.tree.insert_node(parent)?)
    }

    /// Destroy a node and its subtree, unscheduling any drawables in it
    pub fn destroy_node(&mut self, node: NodeId) -> Result<Vec<NodeId>, ScheduleError> {
        let doomed = self.tree.subtree(node)?;
        for n in &doomed {
            if self.drawables.contains_key(n) {
                // Failures of other nodes are recorded by `fail`
                let _ = self.remove(*n);
            }
        }
        Ok(self.tree.destroy_node(node)?)
    }

    /// Apply `ops` to `node` and schedule it for drawing
    pub fn add(
        &mut self,
        node: NodeId,
        ops: impl IntoIterator<Item = StateOp>,
    ) -> Result<(), ScheduleError> {
        if !self.tree.contains(node) {
            return Err(ScheduleError::UnknownNode(node));
        }
        if self.drawables.contains_key(&node) {
            return Err(ScheduleError::AlreadyScheduled(node));
        }

        let others = self.edit(node, ops.into_iter().collect())?;
        self.drawables.insert(node, Drawable::default());
        let mut errors = self.place(node);
        errors.extend(others);
        first_error(errors)
    }

    /// Stop drawing `node`
    ///
    /// Removing a node that is not scheduled is an invariant violation.
    pub fn remove(&mut self, node: NodeId) -> Result<(), ScheduleError> {
        if self.drawables.remove(&node).is_none() {
            invariant_violation!("Scheduler: remove of unscheduled {:?}", node);
        }
        self.failed.remove(&node);

        let errors = if self.batcher.is_member(node) {
            let actions = self.batcher.remove(node);
            self.apply(actions)
        } else {
            Vec::new()
        };
        self.tree.forget_reads(node);
        first_error(errors)
    }

    /// Apply a state delta to `node`, drawable or not
    pub fn update(
        &mut self,
        node: NodeId,
        delta: impl IntoIterator<Item = StateOp>,
    ) -> Result<(), ScheduleError> {
        if !self.tree.contains(node) {
            return Err(ScheduleError::UnknownNode(node));
        }
        let errors = self.edit(node, delta.into_iter().collect())?;
        first_error(errors)
    }

    /// Apply everything staged in `handoff` since the last swap
    pub fn apply_handoff(&mut self, handoff: &mut StateHandoff) -> Vec<ScheduleError> {
        let updates: Vec<_> = handoff.swap().collect();
        let mut errors = Vec::new();
        for update in updates {
            if !self.tree.contains(update.node) {
                errors.push(ScheduleError::UnknownNode(update.node));
                continue;
            }
            match self.edit(update.node, update.ops) {
                Ok(more) => errors.extend(more),
                Err(err) => errors.push(err),
            }
        }
        errors
    }

    /// Try to schedule every failed node again
    pub fn retry_failed(&mut self) -> Vec<ScheduleError> {
        let nodes: Vec<NodeId> = self.failed.keys().copied().collect();
        let mut errors = Vec::new();
        for node in nodes {
            if !self.drawables.contains_key(&node) || self.batcher.is_member(node) {
                self.failed.remove(&node);
                continue;
            }
            errors.extend(self.place(node));
        }
        errors
    }

    /// Switch instancing on or off, dissolving or re-forming every group
    pub fn set_instancing(&mut self, enabled: bool) -> Vec<ScheduleError> {
        if enabled == self.batcher.is_enabled() {
            return Vec::new();
        }

        let ids: Vec<EntryId> = self.order.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.retire(id);
        }
        self.bare.clear();
        self.grouped.clear();
        self.batcher.reset(enabled);
        self.submission.invalidate_uploads();
        self.config.instancing = enabled;

        let nodes: Vec<NodeId> = self.drawables.keys().copied().collect();
        let mut errors = Vec::new();
        for node in nodes {
            self.failed.remove(&node);
            errors.extend(self.place(node));
        }
        log::debug!(
            "Scheduler: instancing {}, {} entries rebuilt",
            if enabled { "enabled" } else { "disabled" },
            self.order.len()
        );
        errors
    }

    /// Emit one frame to `backend`
    pub fn emit<B: Backend + ?Sized>(&mut self, backend: &mut B) -> FrameReport {
        if self.config.retry_failed_on_emit && !self.failed.is_empty() {
            // Errors are logged by `fail`
            let _ = self.retry_failed();
        }

        self.frame += 1;
        let report = self
            .submission
            .emit(self.frame, &self.order, &self.cache, &self.batcher, backend);

        if !report.skipped.is_empty() {
            log::warn!(
                "Scheduler: frame {} skipped {} entries with stale settings",
                self.frame,
                report.skipped.len()
            );
        }
        report
    }

    // ---- Inspection ----

    /// Current counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            frame: self.frame,
            nodes: self.tree.len(),
            drawables: self.drawables.len(),
            entries: self.order.len(),
            failed: self.failed.len(),
            cache: self.cache.stats(),
            batcher: self.batcher.stats(),
        }
    }

    /// Drawn nodes in walk order; group members follow their buffer rows
    pub fn entry_order(&self) -> Vec<NodeId> {
        let mut nodes = Vec::with_capacity(self.drawables.len());
        for (_, entry) in self.order.iter() {
            match entry.source() {
                EntrySource::Bare(node) => nodes.push(node),
                EntrySource::Group(group) => {
                    if let Some(g) = self.batcher.group(group) {
                        nodes.extend_from_slice(g.members());
                    }
                }
            }
        }
        nodes
    }

    /// Entry sources in walk order
    pub fn entries(&self) -> Vec<EntrySource> {
        self.order.iter().map(|(_, e)| e.source()).collect()
    }

    /// Check if a node is registered as drawable
    pub fn is_scheduled(&self, node: NodeId) -> bool {
        self.drawables.contains_key(&node)
    }

    /// Error that keeps `node` out of the frame, if any
    pub fn failure(&self, node: NodeId) -> Option<&ScheduleError> {
        self.failed.get(&node)
    }

    /// All nodes currently left out of the frame
    pub fn failures(&self) -> impl Iterator<Item = (NodeId, &ScheduleError)> {
        self.failed.iter().map(|(n, e)| (*n, e))
    }

    /// Slot schema
    pub fn schema(&self) -> &SlotSchema {
        &self.schema
    }

    /// State tree
    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    /// Setting cache
    pub fn cache(&self) -> &SettingCache {
        &self.cache
    }

    /// Order index
    pub fn order(&self) -> &OrderIndex {
        &self.order
    }

    /// Instance batcher
    pub fn batcher(&self) -> &InstanceBatcher {
        &self.batcher
    }

    /// Active configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Frames emitted
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Program resolver
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Program resolver, mutably
    pub fn resolver_mut(&mut self) -> &mut R {
        &mut self.resolver
    }

    /// Fragment compiler
    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    /// Fragment compiler, mutably
    pub fn compiler_mut(&mut self) -> &mut C {
        &mut self.compiler
    }

    /// Serialize state for hot-reload
    pub fn save_state(&self) -> SchedulerState {
        SchedulerState {
            config: self.config.clone(),
            frame: self.frame,
        }
    }

    /// Restore from serialized state
    pub fn restore_state(&mut self, state: SchedulerState) -> Result<Vec<ScheduleError>, ConfigError> {
        state.config.validate()?;
        self.frame = state.frame;
        let instancing = state.config.instancing;
        self.config = state.config;
        self.config.instancing = self.batcher.is_enabled();
        Ok(self.set_instancing(instancing))
    }

    // ---- Internals ----

    fn check_ops(&self, ops: &[StateOp]) -> Result<(), SchemaError> {
        for op in ops {
            match op {
                StateOp::Define(slot, value) => self.schema.check(*slot, value)?,
                StateOp::Undefine(slot) => {
                    self.schema.slot(*slot).ok_or(SchemaError::UnknownSlot(*slot))?;
                }
            }
        }
        Ok(())
    }

    /// Stage, commit and propagate an edit
    fn edit(&mut self, node: NodeId, ops: Vec<StateOp>) -> Result<Vec<ScheduleError>, ScheduleError> {
        self.check_ops(&ops)?;
        self.tree.stage(node, ops)?;
        let report = self.tree.commit(node)?;
        Ok(self.propagate(report, node))
    }

    fn propagate(&mut self, report: CommitReport, origin: NodeId) -> Vec<ScheduleError> {
        let mut errors = Vec::new();
        for change in &report.changed {
            let outcome = self.cache.notify(change.value, &self.tree, &mut self.compiler);
            for (setting, err) in outcome.failed {
                errors.extend(self.setting_failures(setting, err));
            }
        }

        let mut affected: BTreeSet<NodeId> = report.affected().into_iter().collect();
        affected.insert(origin);
        errors.extend(self.refresh(affected));
        errors
    }

    /// Re-derive drawables in two passes so every stored snapshot is fresh
    /// before any entry is rebuilt
    fn refresh(&mut self, nodes: BTreeSet<NodeId>) -> Vec<ScheduleError> {
        let mut errors = Vec::new();
        let mut plan = Vec::new();

        for node in nodes {
            let Some(drawable) = self.drawables.get(&node) else {
                continue;
            };
            let old = drawable.snapshot.clone();
            match self.derive(node) {
                Ok(derived) => {
                    if old.as_ref() == Some(&derived.snapshot) && !self.failed.contains_key(&node) {
                        continue;
                    }
                    let key = derived.key.clone();
                    let row = derived.row.clone();
                    self.store(node, derived);
                    plan.push(Refresh::Resettle { node, old, key, row });
                }
                Err(err) => {
                    self.fail(node, err.clone());
                    errors.push(err);
                    plan.push(Refresh::Withdraw(node));
                }
            }
        }

        for step in plan {
            match step {
                Refresh::Withdraw(node) => {
                    if self.batcher.is_member(node) {
                        let actions = self.batcher.remove(node);
                        errors.extend(self.apply(actions));
                    }
                }
                Refresh::Resettle { node, old, key, row } => {
                    errors.extend(self.resettle_node(node, old, key, row));
                }
            }
        }
        errors
    }

    fn resettle_node(
        &mut self,
        node: NodeId,
        old: Option<StateSnapshot>,
        key: BatchKey,
        row: Vec<f32>,
    ) -> Vec<ScheduleError> {
        if !self.batcher.is_member(node) {
            self.failed.remove(&node);
            let actions = self.batcher.add(node, key, row);
            return self.apply(actions);
        }

        if self.batcher.key_of(node) != Some(&key) {
            let actions = self.batcher.update(node, key, row);
            return self.apply(actions);
        }

        // Same key: only the instance row and possibly setting bindings moved
        let refill = self.batcher.update(node, key, row);
        debug_assert!(refill.is_empty());
        let Some(snapshot) = self.drawables.get(&node).and_then(|d| d.snapshot.clone()) else {
            return Vec::new();
        };
        let rebound = |slots: &[SlotId]| {
            old.as_ref().map_or(true, |o| !o.same_bindings(&snapshot, slots))
        };

        match self.batcher.group_of(node) {
            Some(group) => {
                if self.batcher.representative(group) != Some(node) {
                    return Vec::new();
                }
                if rebound(self.schema.batch_slots()) {
                    return self.apply(vec![BatchAction::Rebase(group)]);
                }
                if let Some(&id) = self.grouped.get(&group) {
                    if let Some(entry) = self.order.get_mut(id) {
                        entry.snapshot = snapshot;
                    }
                }
            }
            None => {
                let all: Vec<SlotId> = (0..self.schema.len()).map(|i| SlotId(i as u16)).collect();
                if rebound(&all) {
                    return self.apply(vec![BatchAction::RekeyBare(node)]);
                }
                if let Some(&id) = self.bare.get(&node) {
                    if let Some(entry) = self.order.get_mut(id) {
                        entry.snapshot = snapshot;
                    }
                }
            }
        }
        Vec::new()
    }

    /// Derive and register a drawable that is not in the batcher
    fn place(&mut self, node: NodeId) -> Vec<ScheduleError> {
        let derived = match self.derive(node) {
            Ok(derived) => derived,
            Err(err) => {
                self.fail(node, err.clone());
                return vec![err];
            }
        };
        let key = derived.key.clone();
        let row = derived.row.clone();
        self.store(node, derived);
        self.failed.remove(&node);

        let actions = self.batcher.add(node, key, row);
        self.apply(actions)
    }

    fn derive(&mut self, node: NodeId) -> Result<Derived, ScheduleError> {
        let snapshot = self.tree.snapshot(node)?;
        let inputs: Box<[Option<StateValue>]> = self
            .schema
            .program_inputs()
            .iter()
            .map(|slot| snapshot.value(*slot).cloned())
            .collect();

        let cached = self
            .drawables
            .get(&node)
            .and_then(|d| d.program.as_ref())
            .filter(|(cached_inputs, _)| *cached_inputs == inputs)
            .map(|(_, program)| *program);

        let program = match cached {
            Some(program) => program,
            None => self.resolver.resolve(&snapshot).map_err(|source| ScheduleError::Resolve {
                node,
                snapshot: snapshot.clone(),
                source,
            })?,
        };

        Ok(Derived {
            key: BatchKey::from_snapshot(program, &self.schema, &snapshot),
            row: instance_row(&self.schema, &snapshot),
            snapshot,
            inputs,
            program,
        })
    }

    fn store(&mut self, node: NodeId, derived: Derived) {
        let drawable = self.drawables.entry(node).or_default();
        drawable.snapshot = Some(derived.snapshot);
        drawable.program = Some((derived.inputs, derived.program));
    }

    fn fail(&mut self, node: NodeId, err: ScheduleError) {
        log::warn!("Scheduler: dropping {:?} from the frame: {}", node, err);
        self.failed.insert(node, err);
    }

    fn fail_group(&mut self, group: GroupId, err: ScheduleError) {
        for member in self.batcher.evict_group(group) {
            self.fail(member, err.clone());
        }
    }

    fn compile_error(&self, node: NodeId, snapshot: &StateSnapshot, err: CompileError) -> ScheduleError {
        match err {
            CompileError::OutOfMemory => ScheduleError::ResourceExhausted {
                node,
                stats: self.stats(),
            },
            source => ScheduleError::Compile {
                node,
                snapshot: snapshot.clone(),
                source,
            },
        }
    }

    /// One error per node drawn through `setting`, none if nothing holds it
    fn setting_failures(&self, setting: SettingId, err: CompileError) -> Vec<ScheduleError> {
        let mut errors = Vec::new();
        for (_, entry) in self.order.iter() {
            if !entry.settings().iter().any(|s| s.id() == setting) {
                continue;
            }
            match entry.source() {
                EntrySource::Bare(node) => {
                    errors.push(self.compile_error(node, entry.snapshot(), err.clone()));
                }
                EntrySource::Group(group) => {
                    if let Some(group) = self.batcher.group(group) {
                        for member in group.members() {
                            errors.push(self.compile_error(*member, entry.snapshot(), err.clone()));
                        }
                    }
                }
            }
        }
        errors
    }

    fn apply(&mut self, actions: Vec<BatchAction>) -> Vec<ScheduleError> {
        let mut errors = Vec::new();
        for action in actions {
            match action {
                BatchAction::InsertBare(node) => match self.build_entry(EntrySource::Bare(node), node) {
                    Ok(entry) => {
                        let id = self.order.insert(entry);
                        self.bare.insert(node, id);
                        log::trace!("Scheduler: placed {:?} as {:?}", node, id);
                    }
                    Err(err) => {
                        self.batcher.evict(node);
                        self.fail(node, err.clone());
                        errors.push(err);
                    }
                },
                BatchAction::RemoveBare(node) => {
                    let Some(id) = self.bare.remove(&node) else {
                        invariant_violation!("Scheduler: {:?} has no bare entry", node);
                    };
                    self.retire(id);
                }
                BatchAction::RekeyBare(node) => {
                    let Some(&id) = self.bare.get(&node) else {
                        invariant_violation!("Scheduler: {:?} has no bare entry", node);
                    };
                    if let Err(err) = self.resettle(id, EntrySource::Bare(node), node) {
                        self.bare.remove(&node);
                        self.retire(id);
                        self.batcher.evict(node);
                        self.fail(node, err.clone());
                        errors.push(err);
                    }
                }
                BatchAction::InsertGroup(group) => {
                    let Some(rep) = self.batcher.representative(group) else {
                        invariant_violation!("Scheduler: {:?} has no members", group);
                    };
                    match self.build_entry(EntrySource::Group(group), rep) {
                        Ok(entry) => {
                            let id = self.order.insert(entry);
                            self.grouped.insert(group, id);
                            log::trace!("Scheduler: placed {:?} as {:?}", group, id);
                        }
                        Err(err) => {
                            self.fail_group(group, err.clone());
                            errors.push(err);
                        }
                    }
                }
                BatchAction::RemoveGroup(group) => {
                    let Some(id) = self.grouped.remove(&group) else {
                        invariant_violation!("Scheduler: {:?} has no entry", group);
                    };
                    self.retire(id);
                }
                BatchAction::Rebase(group) => {
                    let (Some(&id), Some(rep)) =
                        (self.grouped.get(&group), self.batcher.representative(group))
                    else {
                        invariant_violation!("Scheduler: cannot rebase {:?}", group);
                    };
                    if let Err(err) = self.resettle(id, EntrySource::Group(group), rep) {
                        self.grouped.remove(&group);
                        self.retire(id);
                        self.fail_group(group, err.clone());
                        errors.push(err);
                    }
                }
            }
        }
        errors
    }

    /// Remove an entry and release its settings
    fn retire(&mut self, id: EntryId) {
        let mut entry = self.order.remove(id);
        for setting in entry.take_settings() {
            self.cache.release(setting, &mut self.compiler);
        }
    }

    /// Rebuild an entry in place from `rep`'s current state
    fn resettle(&mut self, id: EntryId, source: EntrySource, rep: NodeId) -> Result<(), ScheduleError> {
        let fresh = self.build_entry(source, rep)?;
        let Some(entry) = self.order.get_mut(id) else {
            invariant_violation!("Scheduler: resettle of unknown entry {:?}", id);
        };
        let Entry {
            snapshot,
            program,
            key,
            settings,
            draw,
            ..
        } = fresh;
        let old = core::mem::replace(&mut entry.settings, settings);
        entry.snapshot = snapshot;
        entry.program = program;
        entry.draw = draw;

        for setting in old {
            self.cache.release(setting, &mut self.compiler);
        }
        self.order.rekey(id, key);
        Ok(())
    }

    fn build_entry(&mut self, source: EntrySource, rep: NodeId) -> Result<Entry, ScheduleError> {
        let Some((snapshot, program)) = self.drawables.get(&rep).and_then(|d| {
            Some((d.snapshot.clone()?, d.program.as_ref()?.1))
        }) else {
            invariant_violation!("Scheduler: {:?} has no derived state", rep);
        };

        let grouped = matches!(source, EntrySource::Group(_));
        let settings = self
            .acquire_settings(program, &snapshot, grouped)
            .map_err(|err| self.compile_error(rep, &snapshot, err))?;

        let value = |slot: Option<SlotId>| slot.and_then(|s| snapshot.value(s));
        let priority = value(self.schema.priority()).and_then(StateValue::as_int).unwrap_or(0);
        let framebuffer = value(self.schema.framebuffer()).and_then(StateValue::as_resource);
        let vertex_source = value(self.schema.vertex_source()).and_then(StateValue::as_resource);
        let range = value(self.schema.index_range()).and_then(StateValue::as_range);

        let mut draw = DrawCommand::single(vertex_source, range);
        if let EntrySource::Group(group) = source {
            let count = self.batcher.group(group).map_or(0, |g| g.len() as u32);
            draw = draw.instanced(group, count);
        }

        let key = SortKey::new(priority, program, framebuffer, vertex_source);
        Ok(Entry::new(source, snapshot, program, key, settings, draw))
    }

    /// Acquire the Frame, PipelineState and uniform settings of an entry
    fn acquire_settings(
        &mut self,
        program: ProgramId,
        snapshot: &StateSnapshot,
        grouped: bool,
    ) -> Result<Vec<SettingRef>, CompileError> {
        let binding = |slot: SlotId| (slot, snapshot.binding(slot));

        let mut plan: Vec<(SettingKind, Vec<(SlotId, Option<ValueId>)>)> = Vec::new();
        plan.push((
            SettingKind::Frame,
            self.schema.framebuffer().map(binding).into_iter().collect(),
        ));
        plan.push((
            SettingKind::PipelineState,
            self.schema.pipeline_slots().iter().map(|s| binding(*s)).collect(),
        ));
        // Undefined uniforms still get a setting that clears the slot
        for slot in self.schema.uniform_slots() {
            if grouped && self.schema.is_instanced(*slot) {
                continue;
            }
            plan.push((SettingKind::Uniform, vec![binding(*slot)]));
        }

        let mut held = Vec::with_capacity(plan.len());
        for (kind, deps) in plan {
            match self.cache.acquire(program, kind, &deps, &self.tree, &mut self.compiler) {
                Ok(setting) => held.push(setting),
                Err(err) => {
                    for setting in held {
                        self.cache.release(setting, &mut self.compiler);
                    }
                    return Err(err);
                }
            }
        }
        Ok(held)
    }
}

impl<R: ProgramResolver, C: FragmentCompiler> Drop for Scheduler<R, C> {
    fn drop(&mut self) {
        let ids: Vec<EntryId> = self.order.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.retire(id);
        }
    }
}

impl<R: ProgramResolver, C: FragmentCompiler> fmt::Debug for Scheduler<R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
