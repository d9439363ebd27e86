//! SentinelFS Core - dual-indexed local state and content hashing
//!
//! This crate provides the data model shared by the rest of the workspace:
//! relative path handling, the bidirectional [`DualIndex`], the lazily
//! computed [`LocalState`], and the default content-hashing function.

pub mod hash;
pub mod index;
pub mod path;
pub mod state;

pub use hash::{dropbox_hash, HashError, HashFn};
pub use index::DualIndex;
pub use path::RelativePath;
pub use state::{LocalState, SizeTime, DIR_SENTINEL};
