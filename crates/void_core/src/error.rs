//! Error types for the core library

use core::fmt;

/// Handle errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// Handle is null
    Null,
    /// Handle is stale (generation mismatch)
    Stale,
    /// Handle index out of bounds
    OutOfBounds,
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::Null => write!(f, "Handle is null"),
            HandleError::Stale => write!(f, "Handle is stale (slot was freed or reused)"),
            HandleError::OutOfBounds => write!(f, "Handle index out of bounds"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HandleError {}
