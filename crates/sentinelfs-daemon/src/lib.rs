//! SentinelFS daemon library.
//!
//! The CLI, config, and logging surface around the
//! `sentinelfs_system::Core` event correlation engine.

pub mod config;
pub mod daemon;

pub use config::{ConfigManager, DaemonConfig};
pub use daemon::Daemon;
