//! Temporal quiet-period release gate.
//!
//! Delays emission until the pending list has been quiet long enough
//! that aggregation is almost certainly complete, then scrubs
//! spurious `Modified` events against the current `LocalState` cache
//! before handing the survivors to the caller.

use std::time::{Duration, Instant};

use sentinelfs_core::state::DIR_SENTINEL;
use tracing::trace;

use crate::aggregator::Aggregator;
use crate::envelope::{EventEnvelope, EventKind};

/// Public, emission-ready event shape (§6: "event emission (output)").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReleasedEvent {
    pub kind: EventKind,
    pub is_directory: bool,
    pub path: String,
    pub to_path: Option<String>,
    pub size: Option<u64>,
    pub mtime_millis: Option<i64>,
    pub hash: Option<String>,
    pub first_seen_millis_ago: u128,
    pub last_seen_millis_ago: u128,
}

pub struct ReleaseGate {
    quiet_period: Duration,
    empty_file_grace: Duration,
}

impl ReleaseGate {
    pub fn new(quiet_period: Duration, empty_file_grace: Duration) -> Self {
        ReleaseGate {
            quiet_period,
            empty_file_grace,
        }
    }

    /// `poll() -> ready events`. Empty unless the whole pending list
    /// has been quiet for `quiet_period`, no copy-probe is hashing,
    /// and every envelope has individually settled.
    pub fn poll(&self, aggregator: &mut Aggregator) -> Vec<ReleasedEvent> {
        let now = Instant::now();

        if now.duration_since(aggregator.last_mutation) <= self.quiet_period {
            return Vec::new();
        }
        if aggregator.block_release {
            return Vec::new();
        }
        if aggregator
            .pending
            .iter()
            .any(|e| now.duration_since(e.last_reworked) <= self.quiet_period)
        {
            return Vec::new();
        }

        let mut ready_idx = Vec::new();
        for (i, e) in aggregator.pending.iter().enumerate() {
            if e.kind == EventKind::Created
                && !e.is_directory
                && e.snapshot.is_empty()
                && now.duration_since(e.last_reworked) <= self.empty_file_grace
            {
                continue;
            }
            ready_idx.push(i);
        }

        // Remove highest index first so earlier indices stay valid.
        ready_idx.sort_unstable_by(|a, b| b.cmp(a));
        let mut taken: Vec<EventEnvelope> = ready_idx
            .into_iter()
            .map(|i| aggregator.pending.remove(i))
            .collect();
        taken.reverse(); // restore insertion order

        let mut output = Vec::new();
        for mut e in taken {
            if e.is_irrelevant {
                trace!(path = %e.ref_path(), "dropping irrelevant envelope");
                continue;
            }

            if e.kind.is_modified() && self.is_spurious_modification(aggregator, &e) {
                trace!(path = %e.ref_path(), "scrubbing spurious modification");
                continue;
            }

            self.update_local_state(aggregator, &mut e);
            output.push(to_released(e));
        }

        output
    }

    /// A `Modified` event is spurious if LocalState's *cached* (not
    /// recomputed — §9 Open Question 4) snapshot already matches the
    /// envelope's own snapshot.
    fn is_spurious_modification(&self, aggregator: &mut Aggregator, e: &EventEnvelope) -> bool {
        let cached_sizetime = aggregator.local_state.get_sizetime(e.ref_path(), false);
        let cached_hash = aggregator
            .local_state
            .get_hash(e.ref_path(), false)
            .unwrap_or(None);
        match (cached_sizetime, e.sizetime()) {
            (Some(cached), Some(current)) if cached == current => {
                cached_hash.is_some() && cached_hash == e.cached_hash()
            }
            _ => false,
        }
    }

    fn update_local_state(&self, aggregator: &mut Aggregator, e: &mut EventEnvelope) {
        match e.kind {
            EventKind::Deleted => {
                aggregator.local_state.delete(e.ref_path());
            }
            EventKind::Created | EventKind::ModifiedContent | EventKind::ModifiedMetadata => {
                let abs = aggregator.local_state.to_absolute(e.ref_path());
                let hash = e.hash(&abs).unwrap_or_else(|| DIR_SENTINEL.to_string());
                if let Some(st) = e.sizetime() {
                    aggregator.local_state.save(e.ref_path().clone(), hash, st);
                }
            }
            EventKind::Moved | EventKind::Copied => {
                // Moved already applied LocalState::move at fold time (§4.3.1);
                // Copied already applied LocalState::save at promotion time (§4.3.2).
            }
        }
    }
}

fn to_released(e: EventEnvelope) -> ReleasedEvent {
    let now = Instant::now();
    ReleasedEvent {
        kind: e.kind,
        is_directory: e.is_directory,
        path: e.path.as_str().to_string(),
        to_path: e.to_path.as_ref().map(|p| p.as_str().to_string()),
        size: e.snapshot.size,
        mtime_millis: e.snapshot.mtime_millis,
        hash: e.cached_hash(),
        first_seen_millis_ago: now.duration_since(e.first_seen).as_millis(),
        last_seen_millis_ago: now.duration_since(e.last_seen).as_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinelfs_core::path::RelativePath;
    use sentinelfs_core::state::LocalState;
    use std::thread::sleep;

    fn gate() -> ReleaseGate {
        ReleaseGate::new(Duration::from_millis(20), Duration::from_millis(20))
    }

    #[test]
    fn poll_withholds_until_quiet_period_elapses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        let mut agg = Aggregator::new(LocalState::new(dir.path()));
        agg.ingest(crate::source::RawEvent {
            kind: crate::source::RawEventKind::Created,
            is_directory: false,
            src_path: dir.path().join("a.txt"),
            dest_path: None,
        });
        let g = gate();
        assert!(g.poll(&mut agg).is_empty());
        sleep(Duration::from_millis(40));
        let out = g.poll(&mut agg);
        assert_eq!(out.len(), 1);
        let _ = RelativePath::new("/a.txt");
    }

    #[test]
    fn irrelevant_envelopes_are_never_released() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = Aggregator::new(LocalState::new(dir.path()));
        agg.ingest(crate::source::RawEvent {
            kind: crate::source::RawEventKind::Created,
            is_directory: false,
            src_path: dir.path().join("tmp.txt"),
            dest_path: None,
        });
        agg.ingest(crate::source::RawEvent {
            kind: crate::source::RawEventKind::Deleted,
            is_directory: false,
            src_path: dir.path().join("tmp.txt"),
            dest_path: None,
        });
        sleep(Duration::from_millis(40));
        let out = gate().poll(&mut agg);
        assert!(out.is_empty());
    }
}
