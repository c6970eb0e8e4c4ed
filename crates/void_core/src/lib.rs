//! # void_core - Void Engine Core
//!
//! Zero-dependency primitives shared by the render scheduler:
//! - **Handles**: typed `{index, generation}` pairs, compared as integers
//! - **Arenas**: generational storage that owns tree nodes, entries and settings
//! - **Errors**: stale/null handle diagnostics
//!
//! ## Philosophy
//! Parent/child links, cache back-references and group memberships are all
//! plain handles into an arena. Nothing holds a pointer into another
//! structure, so rotations, subtree invalidation and disposal are index
//! swaps, and a reused slot is never confused with its previous occupant.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std as alloc;

pub mod error;
pub mod handle;

pub use error::*;
pub use handle::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::HandleError;
    pub use crate::handle::{Arena, Handle};
}
