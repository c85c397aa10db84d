#![warn(unused_extern_crates)]
//! Thread-safe index structures sharing one reader/writer gate: a balanced
//! ordered index and a dynamic octree with reference-tracked relocation.

pub use glam;

mod error;
pub use error::*;

mod gate;
pub use gate::*;

mod avl;
pub use avl::*;

mod ordered;
pub use ordered::*;

mod spatial;
pub use spatial::*;
