//! High-level event envelope.
//!
//! Wraps one raw filesystem notification with eagerly-captured
//! `(size, mtime, inode)` snapshots, a lazily-resolved content hash,
//! and the bookkeeping fields the aggregator uses to fold related
//! notifications together. Mirrors `lazydog.events.LazydogEvent`, with
//! the back-pointer into `LocalState` replaced by a narrow hash-function
//! handle captured at construction (see Design Notes in SPEC_FULL.md).

use std::sync::Arc;
use std::time::Instant;

use sentinelfs_core::hash::HashFn;
use sentinelfs_core::path::RelativePath;
use sentinelfs_core::state::SizeTime;

/// The closed set of event kinds the core understands. `Copied` is
/// synthetic: the raw source never reports it, only the aggregator
/// produces it by promoting a `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    Created,
    Deleted,
    Moved,
    ModifiedContent,
    ModifiedMetadata,
    Copied,
}

impl EventKind {
    pub fn is_modified(&self) -> bool {
        matches!(self, EventKind::ModifiedContent | EventKind::ModifiedMetadata)
    }
}

/// How one relative path relates to another, used to drive the fold
/// rules of §4.3.1 as a `match` instead of an if-elif ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRelation {
    Same,
    StrictAncestor,
    StrictDescendant,
    Unrelated,
}

pub fn relation(a: &RelativePath, b: &RelativePath) -> PathRelation {
    if a == b {
        PathRelation::Same
    } else if a.is_strict_ancestor_of(b) {
        PathRelation::StrictAncestor
    } else if b.is_strict_ancestor_of(a) {
        PathRelation::StrictDescendant
    } else {
        PathRelation::Unrelated
    }
}

/// A filesystem-stat snapshot captured at envelope birth. Any field
/// can be `None` if the path vanished between notification and stat
/// (race between discovery and read, not a hard error).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub size: Option<u64>,
    pub mtime_millis: Option<i64>,
    pub inode: Option<u64>,
    /// Count of non-zero-size files anywhere under the path's subtree,
    /// used to decide emptiness for directories (see SPEC_FULL.md §4.6).
    pub dir_file_qty: Option<u64>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        match self.dir_file_qty {
            Some(qty) => qty == 0,
            None => self.size.map(|s| s == 0).unwrap_or(false),
        }
    }
}

/// One high-level event, alive in the aggregator's pending list until
/// folded away, marked irrelevant, or released.
pub struct EventEnvelope {
    pub kind: EventKind,
    pub is_directory: bool,
    pub path: RelativePath,
    pub to_path: Option<RelativePath>,
    pub snapshot: Snapshot,
    hash_fn: Arc<dyn HashFn>,
    hash_cache: Option<Option<String>>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_reworked: Instant,
    /// Envelopes absorbed into this one by folding; kept for diagnostics
    /// and for re-walking merged metadata, never re-emitted themselves.
    pub related: Vec<RelativePath>,
    /// For a promoted `Copied`, every source candidate whose basename
    /// matched the destination, mapped to that candidate's parent dir.
    /// Multi-valued by design (see spec §4.3.3 and Open Question 1).
    pub possible_sources: std::collections::HashMap<RelativePath, RelativePath>,
    /// Dropped silently by the release gate; never emitted.
    pub is_irrelevant: bool,
    /// Consumed as the secondary half of a fold; removed from the
    /// pending list once this is set.
    pub is_related: bool,
}

impl EventEnvelope {
    pub fn new(
        kind: EventKind,
        is_directory: bool,
        path: RelativePath,
        to_path: Option<RelativePath>,
        snapshot: Snapshot,
        hash_fn: Arc<dyn HashFn>,
    ) -> Self {
        let now = Instant::now();
        EventEnvelope {
            kind,
            is_directory,
            path,
            to_path,
            snapshot,
            hash_fn,
            hash_cache: None,
            first_seen: now,
            last_seen: now,
            last_reworked: now,
            related: Vec::new(),
            possible_sources: std::collections::HashMap::new(),
            is_irrelevant: false,
            is_related: false,
        }
    }

    /// `to_path` if present (the envelope targets a destination, i.e.
    /// `Moved`/`Copied`), else `path`. Writing through this accessor
    /// updates whichever underlying field is currently authoritative.
    pub fn ref_path(&self) -> &RelativePath {
        self.to_path.as_ref().unwrap_or(&self.path)
    }

    pub fn set_ref_path(&mut self, new_path: RelativePath) {
        if self.to_path.is_some() {
            self.to_path = Some(new_path);
        } else {
            self.path = new_path;
        }
    }

    pub fn sizetime(&self) -> Option<SizeTime> {
        if self.is_directory {
            return Some(SizeTime::Dir);
        }
        match (self.snapshot.size, self.snapshot.mtime_millis) {
            (Some(size), Some(mtime_millis)) => Some(SizeTime::File { size, mtime_millis }),
            _ => None,
        }
    }

    pub fn has_same_path_than(&self, other: &EventEnvelope) -> bool {
        self.ref_path() == other.ref_path()
    }

    pub fn has_same_size_than(&self, other: &EventEnvelope) -> bool {
        self.snapshot.size == other.snapshot.size
    }

    pub fn has_same_mtime_than(&self, other: &EventEnvelope) -> bool {
        self.snapshot.mtime_millis == other.snapshot.mtime_millis
    }

    /// Resolves the content hash, computing and caching it on first
    /// call via the narrow handle captured at construction. Directories
    /// hash to the `DIR` sentinel without touching the filesystem.
    pub fn hash(&mut self, absolute_path: &std::path::Path) -> Option<String> {
        if self.is_directory {
            return Some(sentinelfs_core::state::DIR_SENTINEL.to_string());
        }
        if self.hash_cache.is_none() {
            let computed = self.hash_fn.hash(absolute_path).unwrap_or(None);
            self.hash_cache = Some(computed);
        }
        self.hash_cache.clone().flatten()
    }

    pub fn cached_hash(&self) -> Option<String> {
        self.hash_cache.clone().flatten()
    }

    /// Merges `secondary` into `self` (the primary survivor): widens
    /// the related list, advances `last_seen` forward, pulls
    /// `first_seen` backward, bumps `last_reworked` to now, and
    /// invalidates the cached hash if the fold is a content change.
    pub fn fold_in(&mut self, secondary: &EventEnvelope) {
        self.related.push(secondary.ref_path().clone());
        self.related.extend(secondary.related.iter().cloned());
        if secondary.last_seen > self.last_seen {
            self.last_seen = secondary.last_seen;
        }
        if secondary.first_seen < self.first_seen {
            self.first_seen = secondary.first_seen;
        }
        self.last_reworked = Instant::now();
        if secondary.kind == EventKind::ModifiedContent {
            self.hash_cache = None;
            self.snapshot.size = secondary.snapshot.size;
            self.snapshot.mtime_millis = secondary.snapshot.mtime_millis;
        }
    }

    pub fn touch(&mut self) {
        self.last_reworked = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinelfs_core::hash::DropboxHasher;

    fn envelope(kind: EventKind, path: &str) -> EventEnvelope {
        EventEnvelope::new(
            kind,
            false,
            RelativePath::new(path),
            None,
            Snapshot {
                size: Some(9),
                mtime_millis: Some(1000),
                inode: Some(1),
                dir_file_qty: None,
            },
            Arc::new(DropboxHasher),
        )
    }

    #[test]
    fn ref_path_falls_back_to_path_without_destination() {
        let e = envelope(EventKind::Created, "/a.txt");
        assert_eq!(e.ref_path().as_str(), "/a.txt");
    }

    #[test]
    fn ref_path_prefers_destination_and_writes_through() {
        let mut e = envelope(EventKind::Moved, "/a.txt");
        e.to_path = Some(RelativePath::new("/b.txt"));
        assert_eq!(e.ref_path().as_str(), "/b.txt");
        e.set_ref_path(RelativePath::new("/c.txt"));
        assert_eq!(e.to_path.as_ref().unwrap().as_str(), "/c.txt");
        assert_eq!(e.path.as_str(), "/a.txt");
    }

    #[test]
    fn fold_in_widens_seen_window_and_invalidates_hash_on_content_change() {
        let mut primary = envelope(EventKind::Created, "/a.txt");
        primary.hash_cache = Some(Some("deadbeef".into()));
        let mut secondary = envelope(EventKind::ModifiedContent, "/a.txt");
        secondary.snapshot.size = Some(99);
        secondary.first_seen = primary.first_seen - std::time::Duration::from_secs(5);
        primary.fold_in(&secondary);
        assert!(primary.cached_hash().is_none());
        assert_eq!(primary.snapshot.size, Some(99));
        assert_eq!(primary.first_seen, secondary.first_seen);
    }
}
