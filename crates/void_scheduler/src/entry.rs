//! Schedulable draw entries

use crate::backend::ProgramId;
use crate::draw_command::DrawCommand;
use crate::instance_batcher::GroupId;
use crate::schema::ResourceHandle;
use crate::setting_cache::SettingRef;
use crate::state_tree::{NodeId, StateSnapshot};

/// What an entry draws
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntrySource {
    /// One scene node drawn on its own
    Bare(NodeId),
    /// An instance group drawn as one instanced call
    Group(GroupId),
}

/// Total order of entries
///
/// Compared field by field: priority, program, framebuffer, vertex source,
/// then the insertion sequence that makes every live key unique.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SortKey {
    /// Explicit priority, lower draws first
    pub priority: i64,
    /// Resolved program
    pub program: ProgramId,
    /// Bound framebuffer
    pub framebuffer: Option<ResourceHandle>,
    /// Vertex source
    pub vertex_source: Option<ResourceHandle>,
    /// Insertion tie-break, assigned by the order index
    pub sequence: u64,
}

impl SortKey {
    /// Key without a tie-break yet
    pub fn new(
        priority: i64,
        program: ProgramId,
        framebuffer: Option<ResourceHandle>,
        vertex_source: Option<ResourceHandle>,
    ) -> Self {
        Self {
            priority,
            program,
            framebuffer,
            vertex_source,
            sequence: 0,
        }
    }

    /// Check if two keys order identically apart from the tie-break
    pub fn same_order(&self, other: &Self) -> bool {
        (self.priority, self.program, self.framebuffer, self.vertex_source)
            == (other.priority, other.program, other.framebuffer, other.vertex_source)
    }
}

/// One schedulable draw
#[derive(Debug)]
pub struct Entry {
    pub(crate) source: EntrySource,
    pub(crate) snapshot: StateSnapshot,
    pub(crate) program: ProgramId,
    pub(crate) key: SortKey,
    /// Frame, pipeline state, then uniforms in schema order
    pub(crate) settings: Vec<SettingRef>,
    pub(crate) draw: DrawCommand,
}

impl Entry {
    /// Assemble an entry
    pub fn new(
        source: EntrySource,
        snapshot: StateSnapshot,
        program: ProgramId,
        key: SortKey,
        settings: Vec<SettingRef>,
        draw: DrawCommand,
    ) -> Self {
        Self {
            source,
            snapshot,
            program,
            key,
            settings,
            draw,
        }
    }

    /// What the entry draws
    pub fn source(&self) -> EntrySource {
        self.source
    }

    /// State snapshot of the node (or group representative) drawn
    pub fn snapshot(&self) -> &StateSnapshot {
        &self.snapshot
    }

    /// Resolved program
    pub fn program(&self) -> ProgramId {
        self.program
    }

    /// Current sort key
    pub fn key(&self) -> &SortKey {
        &self.key
    }

    /// Held settings
    pub fn settings(&self) -> &[SettingRef] {
        &self.settings
    }

    /// Check if the entry holds the given setting
    pub fn holds(&self, setting: &SettingRef) -> bool {
        self.settings.iter().any(|s| s.id() == setting.id())
    }

    /// Draw issued for the entry
    pub fn draw(&self) -> &DrawCommand {
        &self.draw
    }

    /// Take the held settings out, e.g. for release
    pub(crate) fn take_settings(&mut self) -> Vec<SettingRef> {
        core::mem::take(&mut self.settings)
    }
}
