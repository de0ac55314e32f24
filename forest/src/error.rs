//! The forest pipeline's error hierarchy.
//!
//! Three classes, matching the three ways a pipeline stage can fail:
//! a violated precondition or postcondition (a programmer error, not a
//! data problem), a connectivity file that doesn't parse, and a fabric
//! call that failed.

use forest_connectivity::ConnectivityError;
use forest_fabric::FabricError;

/// A failure from a [`crate::Forest`] pipeline operation.
#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    /// A stage's declared precondition or postcondition did not hold.
    /// Only ever returned in a release build; the same condition panics
    /// via `debug_assert!` first in a debug build.
    #[error("forest invariant violated: {0}")]
    Invariant(String),
    /// The connectivity text failed to parse.
    #[error("connectivity I/O error: {0}")]
    Io(#[from] ConnectivityError),
    /// A messaging fabric call failed.
    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),
}

impl From<forest_partition::PartitionError> for ForestError {
    fn from(err: forest_partition::PartitionError) -> Self {
        match err {
            forest_partition::PartitionError::Fabric(e) => ForestError::Fabric(e),
            other => ForestError::Invariant(other.to_string()),
        }
    }
}

/// Checks `cond`, panicking immediately in a debug build (mirroring the
/// original library's assertion-based fatal path for broken invariants)
/// and returning `Err(ForestError::Invariant)` in a release build, where
/// `debug_assert!` compiles out.
pub(crate) fn assert_invariant(cond: bool, msg: &str) -> Result<(), ForestError> {
    debug_assert!(cond, "{msg}");
    if cond {
        Ok(())
    } else {
        Err(ForestError::Invariant(msg.to_string()))
    }
}
