//! Tree stores
//!
//! A tree store pairs the in-memory index with its persistent cache and
//! keeps them write-through: a structural change in memory is committed to
//! disk before the call returns, so the persistent index is always a subset
//! of (or equal to) the memory index. Signals fire after both sides agree.

pub mod cloud;
pub mod local;

pub use cloud::CloudTreeStore;
pub use local::LocalTreeStore;
