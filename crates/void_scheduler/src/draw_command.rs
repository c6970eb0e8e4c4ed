//! Draw Commands and Backend Ops
//!
//! The op stream handed to a [`Backend`](crate::backend::Backend) each frame.
//! Bare entries produce single-instance draws; grouped entries produce one
//! instanced draw preceded by an instance upload when the group's buffer
//! changed since it was last sent.

use serde::{Deserialize, Serialize};

use crate::backend::{FragmentId, ProgramId};
use crate::entry::EntrySource;
use crate::instance_batcher::GroupId;
use crate::schema::{ResourceHandle, SlotId, StateValue};

/// A draw ready for the backend
#[derive(Clone, Debug, PartialEq)]
pub struct DrawCommand {
    /// Vertex source, `None` for procedural draws
    pub vertex_source: Option<ResourceHandle>,
    /// First index
    pub first_index: u32,
    /// Index count per instance
    pub index_count: u32,
    /// Instance count (1 for bare draws)
    pub instance_count: u32,
    /// Instance group feeding per-instance data, if any
    pub group: Option<GroupId>,
}

impl DrawCommand {
    /// Create a single-instance draw
    pub fn single(vertex_source: Option<ResourceHandle>, range: Option<(u32, u32)>) -> Self {
        let (first_index, index_count) = range.unwrap_or((0, 0));
        Self {
            vertex_source,
            first_index,
            index_count,
            instance_count: 1,
            group: None,
        }
    }

    /// Turn this into an instanced draw over `group`
    pub fn instanced(mut self, group: GroupId, instance_count: u32) -> Self {
        self.group = Some(group);
        self.instance_count = instance_count;
        self
    }

    /// Check if this is an instanced draw
    pub fn is_instanced(&self) -> bool {
        self.group.is_some()
    }

    /// Index range as `(first, count)`
    pub fn index_range(&self) -> (u32, u32) {
        (self.first_index, self.index_count)
    }
}

/// One backend operation
#[derive(Clone, Debug, PartialEq)]
pub enum BackendOp {
    /// Bind a framebuffer (`None` is the default target)
    BindFramebuffer(Option<ResourceHandle>),
    /// Switch program
    UseProgram(ProgramId),
    /// Apply a compiled fixed-function fragment
    ApplyPipelineState(FragmentId),
    /// Set a uniform of the current program
    ApplyUniform {
        /// Uniform slot
        slot: SlotId,
        /// Value to set, `None` clears the slot
        value: Option<StateValue>,
    },
    /// Upload a group's per-instance buffer
    UploadInstances {
        /// Receiving group
        group: GroupId,
        /// Floats per instance
        stride: usize,
        /// Raw little-endian `f32` rows
        data: Vec<u8>,
    },
    /// Issue a draw
    Draw(DrawCommand),
}

impl BackendOp {
    /// Check if this op changes pipeline or uniform state
    pub fn is_state_change(&self) -> bool {
        matches!(
            self,
            Self::BindFramebuffer(_) | Self::ApplyPipelineState(_) | Self::ApplyUniform { .. }
        )
    }
}

/// Summary of one emitted frame
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    /// Frame number
    pub frame: u64,
    /// Entries walked
    pub entries: u32,
    /// Draw ops issued
    pub draws: u32,
    /// Instanced draw ops issued
    pub instanced_draws: u32,
    /// Instances covered by instanced draws
    pub instances: u32,
    /// Setting ops issued (framebuffer, pipeline state, uniforms)
    pub setting_ops: u32,
    /// Program switches
    pub program_switches: u32,
    /// Instance buffer uploads
    pub uploads: u32,
    /// Entries left out because a setting failed to recompile
    #[serde(skip)]
    pub skipped: Vec<EntrySource>,
}

impl FrameReport {
    /// Draws saved by instancing this frame
    pub fn draw_calls_saved(&self) -> u32 {
        self.instances.saturating_sub(self.instanced_draws)
    }
}
