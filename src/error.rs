use glam::Vec3;
use thiserror::Error;

/// Failures raised by the index structures.
///
/// Mutating operations raise synchronously and leave the structure in its
/// last consistent state; no partial edit survives an error. `try_`-prefixed
/// operations convert [`IndexError::NotFound`] into an `Option` instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    /// An entry comparing equal to the one being added is already present.
    #[error("an entry comparing equal is already present")]
    DuplicateKey,

    /// No entry matches the given key.
    #[error("no entry matches the given key")]
    NotFound,

    /// Traversal bounds are malformed (start past end on some axis).
    #[error("query bounds start {start} past their end {end}")]
    InvalidRange { start: Vec3, end: Vec3 },

    /// A fixed-capacity slot array is full. Leaves raise this internally to
    /// make their caller grow the tree; it does not escape the public API.
    #[error("slot array is at capacity ({capacity})")]
    Capacity { capacity: usize },
}
