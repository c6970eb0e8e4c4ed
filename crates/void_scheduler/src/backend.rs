//! External Collaborators
//!
//! The scheduler never talks to a graphics API. It depends on three seams:
//!
//! - [`ProgramResolver`]: maps a state snapshot to a program identity
//! - [`FragmentCompiler`]: compiles fixed-function state into opaque fragments
//! - [`Backend`]: executes the ordered op stream produced by submission

use serde::{Deserialize, Serialize};

use crate::draw_command::BackendOp;
use crate::error::{CompileError, ResolveError};
use crate::schema::{SlotId, StateValue};
use crate::state_tree::StateSnapshot;

/// Identity of a compiled GPU program
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProgramId(pub u64);

/// Identity of a compiled pipeline-state fragment
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragmentId(pub u64);

/// Resolves the program that renders a given effective state
pub trait ProgramResolver {
    /// Pick (or build) the program for `snapshot`
    fn resolve(&mut self, snapshot: &StateSnapshot) -> Result<ProgramId, ResolveError>;
}

/// The pipeline state a fragment must encode
#[derive(Clone, Debug, PartialEq)]
pub struct FragmentRequest<'a> {
    /// Pipeline slots with their effective values, in schema order
    pub state: Vec<(SlotId, Option<&'a StateValue>)>,
}

/// Compiles pipeline-state fragments
pub trait FragmentCompiler {
    /// Compile the fragment for `request`
    fn compile(&mut self, request: &FragmentRequest<'_>) -> Result<FragmentId, CompileError>;

    /// Dispose a fragment no setting references anymore
    fn release(&mut self, fragment: FragmentId);
}

/// Consumer of the per-frame op stream
pub trait Backend {
    /// Execute one frame's ops in order
    fn execute(&mut self, ops: &[BackendOp]);
}

impl<F> ProgramResolver for F
where
    F: FnMut(&StateSnapshot) -> Result<ProgramId, ResolveError>,
{
    fn resolve(&mut self, snapshot: &StateSnapshot) -> Result<ProgramId, ResolveError> {
        self(snapshot)
    }
}

impl Backend for Vec<BackendOp> {
    fn execute(&mut self, ops: &[BackendOp]) {
        self.extend_from_slice(ops);
    }
}
