//! # void_scheduler - Render Command Scheduler
//!
//! Incremental draw scheduling for a retained scene graph:
//! - Hierarchical pipeline state with identity-tracked values
//! - Interned, reference-counted pipeline settings
//! - Ordered draw entries keyed by priority, program, framebuffer and geometry
//! - Automatic instancing of compatible draws
//! - Delta submission: only state that differs from the previous draw is emitted
//!
//! ## Architecture
//!
//! 1. **State tree**: nodes override slots declared in a [`SlotSchema`];
//!    effective state is inherited and recomputed lazily
//! 2. **Setting cache**: compiled state fragments shared between draws
//! 3. **Order index**: draw entries in submission order
//! 4. **Instance batcher**: merges draws that differ only in instanced uniforms
//! 5. **Submission**: turns the order index into a minimal backend op stream
//!
//! ## Example
//!
//! ```ignore
//! use void_scheduler::prelude::*;
//!
//! let mut schema = SlotSchema::builder();
//! let mesh = schema.add(SlotDesc::new("mesh", SlotRole::VertexSource));
//! let color = schema.add(SlotDesc::instanced("color", 4));
//! let schema = schema.build()?;
//!
//! let mut scheduler = Scheduler::with_defaults(schema, my_resolver, my_compiler);
//! let root = scheduler.create_node(None)?;
//! scheduler.update(root, [StateOp::Define(mesh, StateValue::Resource(cube))])?;
//!
//! let node = scheduler.create_node(Some(root))?;
//! scheduler.add(node, [StateOp::Define(color, StateValue::Vec4([1.0, 0.0, 0.0, 1.0]))])?;
//!
//! let report = scheduler.emit(&mut backend);
//! ```

pub mod backend;
pub mod config;
pub mod draw_command;
pub mod entry;
pub mod error;
pub mod handoff;
pub mod instance_batcher;
pub mod instancing;
pub mod order_index;
pub mod schema;
pub mod scheduler;
pub mod setting_cache;
pub mod state_tree;
pub mod submission;

pub use backend::{Backend, FragmentCompiler, FragmentId, FragmentRequest, ProgramId, ProgramResolver};
pub use config::{SchedulerConfig, SchedulerState};
pub use draw_command::{BackendOp, DrawCommand, FrameReport};
pub use entry::{Entry, EntrySource, SortKey};
pub use error::{CompileError, ConfigError, ResolveError, ScheduleError, SchemaError, StateError};
pub use handoff::{HandoffWriter, StagedUpdate, StateHandoff};
pub use instance_batcher::{BatchAction, BatcherStats, GroupId, InstanceBatcher, InstanceGroup};
pub use instancing::{BatchKey, InstanceBuffer};
pub use order_index::{EntryId, OrderIndex};
pub use schema::{ResourceHandle, SlotDesc, SlotId, SlotRole, SlotSchema, StateValue};
pub use scheduler::{Scheduler, SchedulerStats};
pub use setting_cache::{CacheStats, SettingCache, SettingId, SettingKind, SettingRef};
pub use state_tree::{CommitReport, NodeId, StateOp, StateSnapshot, StateTree, ValueId};
pub use submission::Submission;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{Backend, FragmentCompiler, FragmentId, FragmentRequest, ProgramId, ProgramResolver};
    pub use crate::config::SchedulerConfig;
    pub use crate::draw_command::{BackendOp, DrawCommand, FrameReport};
    pub use crate::error::{CompileError, ResolveError, ScheduleError};
    pub use crate::handoff::StateHandoff;
    pub use crate::schema::{ResourceHandle, SlotDesc, SlotId, SlotRole, SlotSchema, StateValue};
    pub use crate::scheduler::Scheduler;
    pub use crate::state_tree::{NodeId, StateOp, StateSnapshot};
}
