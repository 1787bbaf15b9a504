//! Staged firmware writes.
//!
//! A staging target receives firmware bytes incrementally and only commits
//! them once the declared size has arrived and the MD5 matches.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileTarget;
pub use memory::MemoryTarget;
pub use traits::{StageTracker, StagingError, UpdateTarget};
