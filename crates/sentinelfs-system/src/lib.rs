//! SentinelFS System - event correlation engine
//!
//! Watches a directory tree through a pluggable [`RawEventSource`] and
//! turns the noisy low-level notification stream into deduplicated,
//! high-level events: one `Created`/`Deleted`/`Moved`/`Modified` per
//! user action, with `Copied` synthesized for file and directory
//! copies that the OS never reports directly.

pub mod aggregator;
pub mod core;
pub mod envelope;
pub mod release_gate;
pub mod source;

pub use aggregator::Aggregator;
pub use core::{Core, CoreConfig};
pub use envelope::{EventEnvelope, EventKind};
pub use release_gate::ReleaseGate;
pub use source::{NotifyEventSource, RawEvent, RawEventKind, RawEventSource};
