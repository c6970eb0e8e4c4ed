//! Scheduler error types
//!
//! Recoverable failures (program resolution, fragment compilation, resource
//! exhaustion) are values; invariant violations are not. Those go through
//! [`invariant_violation!`], which logs and panics.

use thiserror::Error;
use void_core::HandleError;

use crate::schema::{SlotId, SlotRole};
use crate::scheduler::SchedulerStats;
use crate::state_tree::{NodeId, StateSnapshot};

/// Errors from schema declaration and value checking
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("Unknown slot {0:?}")]
    UnknownSlot(SlotId),

    #[error("Duplicate slot name: {0}")]
    DuplicateName(String),

    #[error("Slot role {0:?} may only be declared once")]
    DuplicateRole(SlotRole),

    #[error("Instanced slot '{0}' has zero width")]
    ZeroInstanceWidth(String),

    #[error("Instanced slot '{0}' cannot feed program resolution")]
    InstancedProgramInput(String),

    #[error("Schema declares {0} slots, limit is {}", crate::schema::MAX_SLOTS)]
    TooManySlots(usize),

    #[error("Value does not fit slot '{slot}' ({role:?})")]
    ValueMismatch { slot: String, role: SlotRole },
}

/// Errors reported by a [`ProgramResolver`](crate::backend::ProgramResolver)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("No program supports this state: {0}")]
    Unsupported(String),

    #[error("Program link failed: {0}")]
    Link(String),
}

/// Errors reported by a [`FragmentCompiler`](crate::backend::FragmentCompiler)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Invalid fragment: {0}")]
    Invalid(String),

    #[error("Backend out of memory")]
    OutOfMemory,
}

/// Errors from state tree edits
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("Invalid node: {0}")]
    Handle(#[from] HandleError),

    #[error("Slot {0:?} is outside the schema")]
    UnknownSlot(SlotId),
}

/// Errors surfaced by the [`Scheduler`](crate::scheduler::Scheduler)
#[derive(Debug, Clone, Error)]
pub enum ScheduleError {
    #[error("Program resolution failed for {node:?}: {source}")]
    Resolve {
        node: NodeId,
        snapshot: StateSnapshot,
        #[source]
        source: ResolveError,
    },

    #[error("Setting compilation failed for {node:?}: {source}")]
    Compile {
        node: NodeId,
        snapshot: StateSnapshot,
        #[source]
        source: CompileError,
    },

    #[error("Backend resources exhausted while scheduling {node:?} ({stats})")]
    ResourceExhausted { node: NodeId, stats: SchedulerStats },

    #[error("Node {0:?} is not part of the state tree")]
    UnknownNode(NodeId),

    #[error("Node {0:?} is already scheduled")]
    AlreadyScheduled(NodeId),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),
}

impl ScheduleError {
    /// The node the error concerns, if any
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Resolve { node, .. }
            | Self::Compile { node, .. }
            | Self::ResourceExhausted { node, .. }
            | Self::UnknownNode(node)
            | Self::AlreadyScheduled(node) => Some(*node),
            _ => None,
        }
    }

    /// The offending state snapshot, if the error carries one
    pub fn snapshot(&self) -> Option<&StateSnapshot> {
        match self {
            Self::Resolve { snapshot, .. } | Self::Compile { snapshot, .. } => Some(snapshot),
            _ => None,
        }
    }
}

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Log and panic on a broken internal invariant
macro_rules! invariant_violation {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*)
    }};
}

pub(crate) use invariant_violation;
