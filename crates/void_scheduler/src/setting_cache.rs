//! Setting Cache
//!
//! Interns the small state-application fragments entries need. A setting is
//! keyed by `(program, kind, dependencies)` where the dependencies are the
//! *identities* ([`ValueId`]s) of the overrides it reads, not their values.
//! Two entries bound to the same override share one setting; two overrides
//! that merely hold equal values do not.
//!
//! # Lifecycle
//!
//! - [`SettingCache::acquire`] interns (compiling on first use) and hands out
//!   a [`SettingRef`]
//! - [`SettingCache::release`] takes the ref back and disposes the setting
//!   when the last one returns
//! - [`SettingCache::notify`] recompiles every setting depending on a value
//!   that changed in place, immediately
//!
//! A `SettingRef` cannot be cloned and must be released; dropping one is a
//! leak and is reported as an invariant violation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use void_core::{Arena, Handle};

use crate::backend::{FragmentCompiler, FragmentId, FragmentRequest, ProgramId};
use crate::error::{invariant_violation, CompileError};
use crate::schema::{ResourceHandle, SlotId, StateValue};
use crate::state_tree::{StateTree, ValueId};

/// Handle to an interned setting
pub type SettingId = Handle<Setting>;

/// Closed set of setting kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettingKind {
    /// Framebuffer binding
    Frame,
    /// Compiled fixed-function state
    PipelineState,
    /// One uniform value of the current program
    Uniform,
}

impl SettingKind {
    /// Whether settings of this kind are interned per program
    pub fn is_program_scoped(self) -> bool {
        matches!(self, Self::Uniform)
    }
}

/// Intern key of a setting
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SettingKey {
    program: Option<ProgramId>,
    kind: SettingKind,
    deps: Box<[(SlotId, Option<ValueId>)]>,
}

impl SettingKey {
    /// Build a key, dropping the program for program-independent kinds
    pub fn new(program: ProgramId, kind: SettingKind, deps: &[(SlotId, Option<ValueId>)]) -> Self {
        Self {
            program: kind.is_program_scoped().then_some(program),
            kind,
            deps: deps.into(),
        }
    }

    /// Kind of setting
    pub fn kind(&self) -> SettingKind {
        self.kind
    }

    /// Declared dependencies
    pub fn deps(&self) -> &[(SlotId, Option<ValueId>)] {
        &self.deps
    }
}

/// Compiled payload of a setting
#[derive(Clone, Debug, PartialEq)]
pub enum SettingPayload {
    /// Bind this framebuffer (`None` is the default target)
    Frame { framebuffer: Option<ResourceHandle> },
    /// Apply this fragment
    PipelineState { fragment: FragmentId },
    /// Set this uniform, or clear it when the slot is undefined
    Uniform { slot: SlotId, value: Option<StateValue> },
}

/// An interned setting
#[derive(Debug)]
pub struct Setting {
    key: SettingKey,
    refcount: u32,
    dirty: bool,
    payload: SettingPayload,
    version: u32,
}

impl Setting {
    /// Intern key
    pub fn key(&self) -> &SettingKey {
        &self.key
    }

    /// Kind of setting
    pub fn kind(&self) -> SettingKind {
        self.key.kind
    }

    /// Live references
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Whether the last recompilation failed
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current payload
    pub fn payload(&self) -> &SettingPayload {
        &self.payload
    }

    /// Bumped on every successful recompilation
    pub fn version(&self) -> u32 {
        self.version
    }
}

/// Move-only reference to an interned setting
///
/// Must be handed back through [`SettingCache::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct SettingRef {
    id: SettingId,
}

impl SettingRef {
    /// Identity of the referenced setting
    pub fn id(&self) -> SettingId {
        self.id
    }
}

impl Drop for SettingRef {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            log::error!("Setting cache: {:?} dropped without release", self.id);
            debug_assert!(false, "setting reference {:?} leaked", self.id);
        }
    }
}

/// Cache counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Interned settings
    pub live_settings: usize,
    /// Live compiled pipeline fragments
    pub compiled_fragments: usize,
    /// Compilations performed, including recompilations
    pub compilations: u64,
    /// Settings disposed
    pub disposals: u64,
}

/// Outcome of [`SettingCache::notify`]
#[derive(Debug, Default)]
pub struct NotifyReport {
    /// Settings recompiled successfully
    pub recompiled: usize,
    /// Settings left dirty, with the failure
    pub failed: Vec<(SettingId, CompileError)>,
}

/// Interning cache of compiled settings
#[derive(Debug, Default)]
pub struct SettingCache {
    settings: Arena<Setting>,
    interned: HashMap<SettingKey, SettingId>,
    dependents: HashMap<ValueId, Vec<SettingId>>,
    stats: CacheStats,
}

impl SettingCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the setting for `(program, kind, deps)`, compiling on first use
    pub fn acquire<C: FragmentCompiler>(
        &mut self,
        program: ProgramId,
        kind: SettingKind,
        deps: &[(SlotId, Option<ValueId>)],
        tree: &StateTree,
        compiler: &mut C,
    ) -> Result<SettingRef, CompileError> {
        let key = SettingKey::new(program, kind, deps);

        if let Some(&id) = self.interned.get(&key) {
            self.settings[id].refcount += 1;
            return Ok(SettingRef { id });
        }

        let payload = Self::compile(&key, tree, compiler)?;
        self.stats.compilations += 1;
        if matches!(payload, SettingPayload::PipelineState { .. }) {
            self.stats.compiled_fragments += 1;
        }

        let id = self.settings.insert(Setting {
            key: key.clone(),
            refcount: 1,
            dirty: false,
            payload,
            version: 0,
        });
        for vid in key.deps.iter().filter_map(|(_, v)| *v) {
            self.dependents.entry(vid).or_default().push(id);
        }
        self.interned.insert(key, id);
        self.stats.live_settings = self.settings.len();

        log::trace!("Setting cache: interned {:?} ({:?})", id, kind);
        Ok(SettingRef { id })
    }

    fn compile<C: FragmentCompiler>(
        key: &SettingKey,
        tree: &StateTree,
        compiler: &mut C,
    ) -> Result<SettingPayload, CompileError> {
        let value_of = |dep: &(SlotId, Option<ValueId>)| dep.1.and_then(|vid| tree.value(vid));

        match key.kind {
            SettingKind::Frame => Ok(SettingPayload::Frame {
                framebuffer: key.deps.first().and_then(value_of).and_then(StateValue::as_resource),
            }),
            SettingKind::PipelineState => {
                let request = FragmentRequest {
                    state: key.deps.iter().map(|dep| (dep.0, value_of(dep))).collect(),
                };
                let fragment = compiler.compile(&request)?;
                Ok(SettingPayload::PipelineState { fragment })
            }
            SettingKind::Uniform => {
                let dep = key
                    .deps
                    .first()
                    .ok_or_else(|| CompileError::Invalid("uniform setting without a slot".into()))?;
                Ok(SettingPayload::Uniform {
                    slot: dep.0,
                    value: value_of(dep).cloned(),
                })
            }
        }
    }

    /// Return a reference, disposing the setting when it was the last
    pub fn release<C: FragmentCompiler>(&mut self, setting: SettingRef, compiler: &mut C) {
        let id = setting.id;
        core::mem::forget(setting);

        let Some(entry) = self.settings.get_mut(id) else {
            invariant_violation!("Setting cache: release of disposed setting {:?}", id);
        };
        if entry.refcount == 0 {
            invariant_violation!("Setting cache: refcount underflow on {:?}", id);
        }
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }

        let Some(setting) = self.settings.remove(id) else {
            return;
        };
        self.interned.remove(&setting.key);
        for vid in setting.key.deps.iter().filter_map(|(_, v)| *v) {
            if let Some(list) = self.dependents.get_mut(&vid) {
                list.retain(|s| *s != id);
                if list.is_empty() {
                    self.dependents.remove(&vid);
                }
            }
        }
        if let SettingPayload::PipelineState { fragment } = setting.payload {
            compiler.release(fragment);
            self.stats.compiled_fragments -= 1;
        }
        self.stats.disposals += 1;
        self.stats.live_settings = self.settings.len();

        log::trace!("Setting cache: disposed {:?}", id);
    }

    /// Recompile every setting depending on `value`
    pub fn notify<C: FragmentCompiler>(
        &mut self,
        value: ValueId,
        tree: &StateTree,
        compiler: &mut C,
    ) -> NotifyReport {
        let mut report = NotifyReport::default();
        let Some(ids) = self.dependents.get(&value).cloned() else {
            return report;
        };

        for id in ids {
            let Some(setting) = self.settings.get_mut(id) else {
                continue;
            };
            match Self::compile(&setting.key, tree, compiler) {
                Ok(payload) => {
                    self.stats.compilations += 1;
                    if let SettingPayload::PipelineState { fragment } = setting.payload {
                        compiler.release(fragment);
                    }
                    setting.payload = payload;
                    setting.dirty = false;
                    setting.version = setting.version.wrapping_add(1);
                    report.recompiled += 1;
                }
                Err(err) => {
                    log::warn!("Setting cache: recompiling {:?} failed: {}", id, err);
                    setting.dirty = true;
                    report.failed.push((id, err));
                }
            }
        }
        report
    }

    /// Look up a setting
    pub fn get(&self, id: SettingId) -> Option<&Setting> {
        self.settings.get(id)
    }

    /// Whether the referenced setting failed its last recompilation
    pub fn is_dirty(&self, setting: &SettingRef) -> bool {
        self.settings.get(setting.id).map_or(true, |s| s.dirty)
    }

    /// Interned setting for a key, if any
    pub fn lookup(&self, program: ProgramId, kind: SettingKind, deps: &[(SlotId, Option<ValueId>)]) -> Option<SettingId> {
        self.interned.get(&SettingKey::new(program, kind, deps)).copied()
    }

    /// Settings depending on `value`
    pub fn dependents(&self, value: ValueId) -> &[SettingId] {
        self.dependents.get(&value).map_or(&[], Vec::as_slice)
    }

    /// Number of interned settings
    pub fn len(&self) -> usize {
        self.settings.len()
    }

    /// Check if nothing is interned
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Iterate over interned settings
    pub fn iter(&self) -> impl Iterator<Item = (SettingId, &Setting)> {
        self.settings.iter()
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
