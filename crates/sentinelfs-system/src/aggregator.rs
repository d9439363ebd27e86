//! The core folding state machine.
//!
//! Single-threaded: every public method here is called with the
//! `Core` lock already held (see `core.rs` and SPEC_FULL.md §5). Input
//! is one [`RawEvent`] at a time; output is whatever lands in
//! `pending`, from which [`crate::release_gate::ReleaseGate`] later
//! extracts emissions. Grounded on `lazydog.handlers.HighlevelEventHandler`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::{Duration, Instant};

use sentinelfs_core::hash::HashFn;
use sentinelfs_core::path::RelativePath;
use sentinelfs_core::state::{LocalState, DIR_SENTINEL};
use tracing::{debug, trace};

use crate::envelope::{relation, EventEnvelope, EventKind, PathRelation, Snapshot};
use crate::source::{RawEvent, RawEventKind};

/// Candidate parent destination directories being watched for
/// collective promotion to a directory-level `Copied` (§4.3.3).
const COPY_GROUP_EXPIRY: Duration = Duration::from_secs(20 * 60);

pub struct Aggregator {
    pub(crate) local_state: LocalState,
    pub(crate) pending: Vec<EventEnvelope>,
    copy_watch_set: HashMap<RelativePath, Instant>,
    pub(crate) block_release: bool,
    pub(crate) last_mutation: Instant,
    copy_group_expiry: Duration,
}

impl Aggregator {
    pub fn new(local_state: LocalState) -> Self {
        Aggregator {
            local_state,
            pending: Vec::new(),
            copy_watch_set: HashMap::new(),
            block_release: false,
            last_mutation: Instant::now(),
            copy_group_expiry: COPY_GROUP_EXPIRY,
        }
    }

    /// Overrides the default 20-minute copy-group watch-set expiry
    /// (SPEC_FULL.md §9 Open Question 2).
    pub fn with_copy_group_expiry(mut self, expiry: Duration) -> Self {
        self.copy_group_expiry = expiry;
        self
    }

    fn touch(&mut self) {
        self.last_mutation = Instant::now();
    }

    /// Wraps a raw notification into an [`EventEnvelope`] (eager stat
    /// snapshot, lazy hash) and folds it into the pending list.
    pub fn ingest(&mut self, raw: RawEvent) {
        let path = self.local_state.to_relative(&raw.src_path);
        let to_path = raw
            .dest_path
            .as_ref()
            .map(|p| self.local_state.to_relative(p));
        let abs_for_snapshot = raw.dest_path.as_deref().unwrap_or(&raw.src_path);
        let snapshot = snapshot_for(abs_for_snapshot, raw.is_directory);
        let kind = match raw.kind {
            RawEventKind::Created => EventKind::Created,
            RawEventKind::Deleted => EventKind::Deleted,
            RawEventKind::Moved => EventKind::Moved,
            RawEventKind::ModifiedContent => EventKind::ModifiedContent,
            RawEventKind::ModifiedMetadata => EventKind::ModifiedMetadata,
        };
        let envelope = EventEnvelope::new(
            kind,
            raw.is_directory,
            path,
            to_path,
            snapshot,
            self.local_state.hash_fn(),
        );
        self.fold(envelope);
        self.touch();
    }

    /// Dispatches one arriving envelope `l` per the rules of
    /// SPEC_FULL.md §4.3.1, applied in the order written.
    fn fold(&mut self, l: EventEnvelope) {
        trace!(kind = ?l.kind, path = %l.ref_path(), pending = self.pending.len(), "folding event");
        match l.kind {
            EventKind::Deleted => self.fold_deleted(l),
            EventKind::Moved => self.fold_moved(l),
            EventKind::ModifiedContent | EventKind::ModifiedMetadata => self.fold_modified(l),
            EventKind::Created => self.fold_created(l),
            EventKind::Copied => self.pending.push(l),
        }
    }

    fn fold_deleted(&mut self, mut l: EventEnvelope) {
        // Backward-order deletes: L ancestor of a pending Deleted e -> absorb e.
        let mut i = 0;
        while i < self.pending.len() {
            let same_kind_ancestor = self.pending[i].kind == EventKind::Deleted
                && relation(l.ref_path(), self.pending[i].ref_path()) == PathRelation::StrictAncestor;
            if same_kind_ancestor {
                let e = self.pending.remove(i);
                l.fold_in(&e);
            } else {
                i += 1;
            }
        }

        // Same ref_path handling.
        if let Some(idx) = self
            .pending
            .iter()
            .position(|e| e.ref_path() == l.ref_path())
        {
            let kind = self.pending[idx].kind;
            match kind {
                EventKind::Created | EventKind::Copied | EventKind::ModifiedContent
                | EventKind::ModifiedMetadata => {
                    let e = self.pending.remove(idx);
                    l.fold_in(&e);
                    l.is_irrelevant = true;
                    self.pending.push(l);
                    return;
                }
                EventKind::Moved => {
                    let e = self.pending.remove(idx);
                    l.fold_in(&e);
                    l.path = e.path.clone();
                    self.pending.push(l);
                    return;
                }
                EventKind::Deleted => {}
            }
        }

        self.pending.push(l);
    }

    fn fold_moved(&mut self, mut l: EventEnvelope) {
        let to = l.to_path.clone().expect("Moved envelope carries to_path");
        self.local_state.move_path(&l.path, &to);

        // Candidate still referencing l.path as its ref_path absorbs L.
        if let Some(idx) = self.pending.iter().position(|e| {
            e.ref_path() == &l.path
                && matches!(e.kind, EventKind::Created | EventKind::Copied | EventKind::Moved)
        }) {
            let mut e = self.pending.remove(idx);
            e.fold_in(&l);
            e.set_ref_path(to.clone());
            self.pending.push(e);
            return;
        }

        // Ancestor-move folding: a prior Moved e with l.path strictly under e.path absorbs L.
        if let Some(idx) = self
            .pending
            .iter()
            .position(|e| e.kind == EventKind::Moved && e.path.is_strict_ancestor_of(&l.path))
        {
            let e = &mut self.pending[idx];
            e.fold_in(&l);
            return;
        }

        l.touch();
        self.pending.push(l);
    }

    fn fold_modified(&mut self, mut l: EventEnvelope) {
        if l.is_directory {
            l.is_related = true;
            return;
        }

        for idx in (0..self.pending.len()).rev() {
            let e = &self.pending[idx];
            let absorbs = matches!(e.kind, EventKind::Deleted | EventKind::Moved | EventKind::Copied)
                && (l.ref_path() == e.ref_path() || e.ref_path().is_strict_ancestor_of(l.ref_path()));
            if absorbs {
                let mut e = self.pending.remove(idx);
                e.fold_in(&l);
                self.pending.insert(idx, e);
                return;
            }
            let same_path_created_or_modified =
                matches!(e.kind, EventKind::Created) || e.kind.is_modified();
            if same_path_created_or_modified && e.ref_path() == l.ref_path() {
                let rearm = e.kind == EventKind::Created && l.kind == EventKind::ModifiedMetadata;
                let mut e = self.pending.remove(idx);
                e.fold_in(&l);
                if rearm {
                    e.touch();
                }
                self.pending.insert(idx, e);
                self.try_promote_copy(idx);
                return;
            }
        }

        self.pending.push(l);
    }

    fn fold_created(&mut self, l: EventEnvelope) {
        self.pending.push(l);
        let idx = self.pending.len() - 1;
        self.try_promote_copy(idx);
    }

    /// §4.3.2: after a `Created` arrives (or is re-armed), check
    /// whether it is actually the destination of a copy.
    fn try_promote_copy(&mut self, idx: usize) {
        if self.pending[idx].kind != EventKind::Created {
            return;
        }
        let Some(sizetime) = self.pending[idx].sizetime() else {
            return;
        };
        let size = match sizetime.size() {
            Some(s) if s > 0 => s,
            _ => return,
        };
        let _ = size;

        let candidates = self.local_state.lookup_by_sizetime(&sizetime);
        if candidates.is_empty() {
            return;
        }

        self.block_release = true;
        let abs = self.local_state.to_absolute(self.pending[idx].ref_path());
        let hash = self.pending[idx].hash(&abs);
        self.block_release = false;

        let Some(hash) = hash else { return };
        let sources = self.local_state.lookup_by_hash(&hash);
        if sources.is_empty() {
            return;
        }

        let dest = self.pending[idx].ref_path().clone();
        let chosen = choose_most_potential_source(&sources, &dest);
        let Some(chosen) = chosen else { return };

        let dest_basename = dest.basename().to_string();
        let mut possible_sources = HashMap::new();
        for s in &sources {
            if s.basename() == dest_basename {
                if let Some(parent) = s.parent() {
                    possible_sources.insert(s.clone(), parent);
                }
            }
        }

        debug!(source = %chosen, dest = %dest, "promoting Created to Copied");
        let c = &mut self.pending[idx];
        c.kind = EventKind::Copied;
        c.to_path = Some(dest.clone());
        c.path = chosen.clone();
        c.possible_sources = possible_sources;
        c.touch();

        if let Some(parent) = dest.parent() {
            self.copy_watch_set.insert(parent, Instant::now());
        }
        self.local_state.save(dest, hash, sizetime);

        self.promote_directories();
    }

    /// §4.3.3: collapse N sibling `Copied` events plus their parent
    /// `Created` into a single directory-level `Copied`. Implemented
    /// as a bounded worklist loop rather than the source's recursive
    /// `_posttreat_copied_folder` (SPEC_FULL.md §9 redesign note).
    fn promote_directories(&mut self) {
        self.prune_expired_watch_entries();

        let mut worklist: Vec<RelativePath> = self.copy_watch_set.keys().cloned().collect();
        let mut visited: HashSet<RelativePath> = HashSet::new();

        while let Some(tp) = worklist.pop() {
            if !visited.insert(tp.clone()) {
                continue;
            }
            if let Some(parent) = self.try_promote_one(&tp) {
                worklist.push(parent);
            }
        }
    }

    /// Attempts to promote the watched directory `tp`; returns the
    /// parent of `tp` if a promotion happened (so the caller can check
    /// whether the grandparent is now promotable too).
    ///
    /// The directory-created event's `ref_path` is always `tp`, before
    /// and after promotion (promoting it only rewrites `kind`/`path`,
    /// never `to_path`), so it is looked up by that path rather than a
    /// cached vector index: `self.pending` is mutated (elements
    /// removed) while this function runs, which would otherwise leave
    /// a once-valid index pointing at the wrong envelope.
    fn try_promote_one(&mut self, tp: &RelativePath) -> Option<RelativePath> {
        // group[sp] = ref_paths of pending Copied children whose possible_sources claims sp as parent.
        let mut groups: HashMap<RelativePath, Vec<RelativePath>> = HashMap::new();
        for e in self.pending.iter() {
            if e.kind != EventKind::Copied {
                continue;
            }
            let Some(parent) = e.to_path.as_ref().and_then(|p| p.parent()) else {
                continue;
            };
            if &parent != tp {
                continue;
            }
            for src_parent in e.possible_sources.values() {
                groups
                    .entry(src_parent.clone())
                    .or_default()
                    .push(e.ref_path().clone());
            }
        }

        // Empty-copy companions: pending empty Created events under tp whose
        // counterpart under some candidate sp also exists and is empty.
        let empty_created: Vec<RelativePath> = self
            .pending
            .iter()
            .filter(|e| {
                e.kind == EventKind::Created
                    && e.ref_path().parent().as_ref() == Some(tp)
                    && e.snapshot.is_empty()
            })
            .map(|e| e.ref_path().clone())
            .collect();

        for companion in &empty_created {
            let basename = companion.basename().to_string();
            for sp in groups.keys().cloned().collect::<Vec<_>>() {
                let candidate_src = RelativePath::new(format!("{sp}/{basename}"));
                let candidate_abs = self.local_state.to_absolute(&candidate_src);
                if is_empty_path(&candidate_abs) {
                    groups.entry(sp).or_default().push(companion.clone());
                }
            }
        }

        let tp_count = listdir_count(&self.local_state.to_absolute(tp));

        let mut promoted_any = false;
        for (sp, members) in groups {
            let sp_count = listdir_count(&self.local_state.to_absolute(&sp));
            let promotable = match (sp_count, tp_count) {
                (Some(sc), Some(tc)) => members.len() as u64 == sc && sc == tc,
                _ => false,
            };
            if !promotable {
                continue;
            }

            if self
                .pending
                .iter()
                .any(|e| e.kind == EventKind::Created && e.ref_path() == tp)
            {
                if let Some(parent_of_tp) = tp.parent() {
                    self.copy_watch_set.insert(parent_of_tp, Instant::now());
                }
                for member_path in &members {
                    if member_path == tp {
                        continue;
                    }
                    let Some(mi) = self
                        .pending
                        .iter()
                        .position(|e| e.kind == EventKind::Created && e.ref_path() == member_path)
                    else {
                        continue;
                    };
                    let basename = self.pending[mi].ref_path().basename().to_string();
                    let source = RelativePath::new(format!("{sp}/{basename}"));
                    let dest = self.pending[mi].ref_path().clone();
                    let sizetime = self.pending[mi].sizetime();
                    let is_dir_dest = self.pending[mi].is_directory;
                    self.pending[mi].kind = EventKind::Copied;
                    self.pending[mi].to_path = Some(dest.clone());
                    self.pending[mi].path = source.clone();
                    if let Some(st) = sizetime {
                        let hash = if is_dir_dest {
                            DIR_SENTINEL.to_string()
                        } else {
                            let abs = self.local_state.to_absolute(&dest);
                            self.pending[mi]
                                .hash(&abs)
                                .unwrap_or_else(|| DIR_SENTINEL.to_string())
                        };
                        self.local_state.save(dest, hash, st);
                    }
                    let promoted = self.pending.remove(mi);
                    if let Some(dc_idx) =
                        self.pending.iter().position(|e| e.ref_path() == tp)
                    {
                        self.pending[dc_idx].fold_in(&promoted);
                    }
                }
                promoted_any = true;
            }

            // Always: attach just this sp to dirCreated (Open Question 1 fix —
            // no longer attaches the whole survivor set inside the loop).
            if let Some(dc_idx) = self.pending.iter().position(|e| e.ref_path() == tp) {
                self.attach_source(dc_idx, &sp, tp);
                promoted_any = true;
            }
        }

        if promoted_any {
            self.copy_watch_set.remove(tp);
            if let Some(dc_idx) = self.pending.iter().position(|e| e.ref_path() == tp) {
                if let Some(st) = self.pending[dc_idx].sizetime() {
                    let dest = self.pending[dc_idx].ref_path().clone();
                    let hash = self.pending[dc_idx]
                        .cached_hash()
                        .unwrap_or_else(|| DIR_SENTINEL.to_string());
                    self.local_state.save(dest, hash, st);
                }
            }
            tp.parent()
        } else {
            None
        }
    }

    /// `add_source_and_promote`: attaches `sp` to the possible-sources
    /// set of the pending `Created` at `idx`, promoting it to `Copied`
    /// on first attachment.
    fn attach_source(&mut self, idx: usize, sp: &RelativePath, tp: &RelativePath) {
        let e = &mut self.pending[idx];
        if e.kind != EventKind::Copied {
            e.kind = EventKind::Copied;
            e.to_path = Some(tp.clone());
            e.path = sp.clone();
        }
        e.possible_sources.insert(sp.clone(), sp.parent().unwrap_or_else(|| RelativePath::new("/")));
        e.touch();
    }

    fn prune_expired_watch_entries(&mut self) {
        let expiry = self.copy_group_expiry;
        self.copy_watch_set
            .retain(|_, touched_at| touched_at.elapsed() < expiry);
    }
}

fn snapshot_for(absolute_path: &Path, is_directory: bool) -> Snapshot {
    if is_directory {
        return Snapshot {
            size: None,
            mtime_millis: None,
            inode: stat_inode(absolute_path),
            dir_file_qty: Some(count_nonzero_files(absolute_path)),
        };
    }
    match std::fs::metadata(absolute_path) {
        Ok(meta) => {
            let mtime_millis = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64);
            Snapshot {
                size: Some(meta.len()),
                mtime_millis,
                inode: stat_inode(absolute_path),
                dir_file_qty: None,
            }
        }
        Err(_) => Snapshot::default(),
    }
}

#[cfg(unix)]
fn stat_inode(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::symlink_metadata(path).ok().map(|m| m.ino())
}

#[cfg(not(unix))]
fn stat_inode(_path: &Path) -> Option<u64> {
    None
}

/// Recursively counts non-zero-size files under `path`'s subtree, used
/// to decide directory "emptiness" (SPEC_FULL.md §4.6).
fn count_nonzero_files(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut count = 0;
    for entry in entries.flatten() {
        let p = entry.path();
        if p.is_dir() {
            count += count_nonzero_files(&p);
        } else if let Ok(meta) = entry.metadata() {
            if meta.len() > 0 {
                count += 1;
            }
        }
    }
    count
}

fn is_empty_path(path: &Path) -> bool {
    if path.is_dir() {
        count_nonzero_files(path) == 0
    } else {
        std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(false)
    }
}

/// Direct-child count of a directory, or `None` on listdir failure
/// (§7: a `None` comparison is always false, so promotion is skipped).
fn listdir_count(path: &Path) -> Option<u64> {
    std::fs::read_dir(path).ok().map(|entries| entries.count() as u64)
}

/// Among candidate sources `s`, prefer one whose stem (basename minus
/// final extension) is a substring of the destination's stem;
/// tie-break by longest path; otherwise return any element.
fn choose_most_potential_source(
    sources: &HashSet<RelativePath>,
    dest: &RelativePath,
) -> Option<RelativePath> {
    let dest_stem = stem(dest.basename());
    let mut best: Option<&RelativePath> = None;
    for s in sources {
        let s_stem = stem(s.basename());
        let matches = dest_stem.contains(&s_stem);
        match best {
            None => {
                if matches {
                    best = Some(s);
                }
            }
            Some(current) => {
                if matches && s.as_str().len() > current.as_str().len() {
                    best = Some(s);
                }
            }
        }
    }
    best.cloned().or_else(|| sources.iter().next().cloned())
}

fn stem(basename: &str) -> String {
    match basename.rfind('.') {
        Some(0) | None => basename.to_string(),
        Some(idx) => basename[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn new_aggregator(root: &Path) -> Aggregator {
        Aggregator::new(LocalState::new(root))
    }

    fn raw_created(root: &Path, rel: &str, is_dir: bool) -> RawEvent {
        RawEvent {
            kind: RawEventKind::Created,
            is_directory: is_dir,
            src_path: root.join(rel.trim_start_matches('/')),
            dest_path: None,
        }
    }

    #[test]
    fn create_then_delete_cancels_within_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_aggregator(dir.path());
        let file = dir.path().join("tmp.txt");
        fs::write(&file, b"x").unwrap();
        agg.ingest(raw_created(dir.path(), "tmp.txt", false));
        fs::remove_file(&file).unwrap();
        agg.ingest(RawEvent {
            kind: RawEventKind::Deleted,
            is_directory: false,
            src_path: file,
            dest_path: None,
        });
        assert!(agg.pending.iter().any(|e| e.is_irrelevant));
    }

    #[test]
    fn mkdir_produces_single_created_directory_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_aggregator(dir.path());
        let sub = dir.path().join("dir1");
        fs::create_dir(&sub).unwrap();
        agg.ingest(raw_created(dir.path(), "dir1", true));
        assert_eq!(agg.pending.len(), 1);
        assert_eq!(agg.pending[0].kind, EventKind::Created);
        assert!(agg.pending[0].is_directory);
        assert_eq!(agg.pending[0].ref_path().as_str(), "/dir1");
    }

    #[test]
    fn copy_promotes_created_into_copied() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file1.txt"), b"0123456789012345").unwrap();
        let mut agg = new_aggregator(dir.path());
        // Seed LocalState with the source's known hash/sizetime.
        agg.local_state
            .get_hash(&RelativePath::new("/file1.txt"), true)
            .unwrap();
        agg.local_state
            .get_sizetime(&RelativePath::new("/file1.txt"), true);

        fs::copy(dir.path().join("file1.txt"), dir.path().join("copied.txt")).unwrap();
        agg.ingest(raw_created(dir.path(), "copied.txt", false));

        let copied = agg
            .pending
            .iter()
            .find(|e| e.kind == EventKind::Copied)
            .expect("expected a promoted Copied event");
        assert_eq!(copied.path.as_str(), "/file1.txt");
        assert_eq!(copied.to_path.as_ref().unwrap().as_str(), "/copied.txt");
    }

    #[test]
    fn double_move_collapses_to_single_source_and_final_destination() {
        // SPEC_FULL.md §9 Open Question 5: A -> B -> C should surface as
        // one Moved{A, C}, not two separate Moved events.
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let mut agg = new_aggregator(dir.path());

        fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
        agg.ingest(RawEvent {
            kind: RawEventKind::Moved,
            is_directory: false,
            src_path: dir.path().join("a.txt"),
            dest_path: Some(dir.path().join("b.txt")),
        });

        fs::rename(dir.path().join("b.txt"), dir.path().join("c.txt")).unwrap();
        agg.ingest(RawEvent {
            kind: RawEventKind::Moved,
            is_directory: false,
            src_path: dir.path().join("b.txt"),
            dest_path: Some(dir.path().join("c.txt")),
        });

        let moves: Vec<&EventEnvelope> = agg
            .pending
            .iter()
            .filter(|e| e.kind == EventKind::Moved)
            .collect();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].path.as_str(), "/a.txt");
        assert_eq!(moves[0].to_path.as_ref().unwrap().as_str(), "/c.txt");
    }

    #[test]
    fn directory_modified_event_is_marked_related_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut agg = new_aggregator(dir.path());
        agg.ingest(RawEvent {
            kind: RawEventKind::ModifiedContent,
            is_directory: true,
            src_path: dir.path().to_path_buf(),
            dest_path: None,
        });
        assert!(agg.pending.is_empty());
    }
}
