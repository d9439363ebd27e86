//! Tracks the current state of the watched directory tree.
//!
//! Keeps two [`DualIndex`] instances: one for content hashes, one for
//! `(size, mtime)` pairs. Both are lazily populated — a lookup that
//! misses computes and caches the value rather than requiring an
//! upfront full-tree scan, which is what makes `Created -> Copied`
//! correlation affordable on large trees (see [`LocalState::lookup_by_hash`]).

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::hash::{HashError, HashFn};
use crate::index::DualIndex;
use crate::path::RelativePath;

/// Sentinel hash/size/mtime value used for directories, so that `None`
/// is reserved for "path does not exist".
pub const DIR_SENTINEL: &str = "DIR";

/// `(size_bytes, mtime_millis)` for a regular file, or the
/// [`DIR_SENTINEL`] pair for a directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SizeTime {
    File { size: u64, mtime_millis: i64 },
    Dir,
}

impl SizeTime {
    pub fn size(&self) -> Option<u64> {
        match self {
            SizeTime::File { size, .. } => Some(*size),
            SizeTime::Dir => None,
        }
    }
}

/// Keeps track of every sub-file and sub-directory under a watched
/// root, associating each with its hash and `(size, mtime)`, computed
/// on demand and cached.
pub struct LocalState {
    root: std::path::PathBuf,
    hash_fn: Arc<dyn HashFn>,
    hashes: DualIndex<String>,
    sizetimes: DualIndex<SizeTime>,
}

impl LocalState {
    /// Creates a fresh, empty `LocalState` over `root`, using the
    /// default Dropbox-compatible hasher.
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        LocalState {
            root: root.into(),
            hash_fn: Arc::new(crate::hash::DropboxHasher),
            hashes: DualIndex::new(),
            sizetimes: DualIndex::new(),
        }
    }

    /// Creates a `LocalState` with a caller-supplied hash function,
    /// e.g. to plug in a different content-addressing scheme.
    pub fn with_hash_fn(root: impl Into<std::path::PathBuf>, hash_fn: Arc<dyn HashFn>) -> Self {
        LocalState {
            root: root.into(),
            hash_fn,
            hashes: DualIndex::new(),
            sizetimes: DualIndex::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// §4.2 constructor option (b): walks the tree under `root` and
    /// populates both indexes eagerly by calling [`LocalState::get_hash`]
    /// and [`LocalState::get_sizetime`] on every discovered entry. Used
    /// on a cold start with no caller-supplied seed map.
    pub fn populate_by_walking(&mut self) {
        let root = self.root.clone();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let abs = entry.path();
                let rel = self.to_relative(&abs);
                let _ = self.get_hash(&rel, true);
                self.get_sizetime(&rel, true);
                if abs.is_dir() {
                    stack.push(abs);
                }
            }
        }
    }

    pub fn hash_fn(&self) -> Arc<dyn HashFn> {
        Arc::clone(&self.hash_fn)
    }

    pub fn to_absolute(&self, rel: &RelativePath) -> std::path::PathBuf {
        rel.to_absolute(&self.root)
    }

    pub fn to_relative(&self, absolute: &Path) -> RelativePath {
        RelativePath::from_absolute(&self.root, absolute)
    }

    /// Gets the content hash at `key`. If unknown and `compute_if_absent`
    /// is `true` (the default-ish behaviour), computes and caches it.
    /// Returns `None` if the path doesn't exist.
    pub fn get_hash(
        &mut self,
        key: &RelativePath,
        compute_if_absent: bool,
    ) -> Result<Option<String>, HashError> {
        if !self.hashes.contains(key) && compute_if_absent {
            let abs = self.to_absolute(key);
            let value = if abs.is_dir() {
                Some(DIR_SENTINEL.to_string())
            } else {
                self.hash_fn.hash(&abs)?
            };
            if let Some(v) = &value {
                self.hashes.save(key.clone(), v.clone());
            }
        }
        Ok(self.hashes.get(key).cloned())
    }

    /// Every path currently sharing `hash`, after pruning any that no
    /// longer exist on disk (self-healing reverse lookup).
    pub fn lookup_by_hash(&mut self, hash: &str) -> HashSet<RelativePath> {
        let candidates = self.hashes.get_by_value(&hash.to_string());
        self.prune_deleted(candidates)
    }

    /// Gets the `(size, mtime)` pair at `key`, computing and caching it
    /// on first access if `compute_if_absent` is set.
    pub fn get_sizetime(
        &mut self,
        key: &RelativePath,
        compute_if_absent: bool,
    ) -> Option<SizeTime> {
        if !self.sizetimes.contains(key) && compute_if_absent {
            let abs = self.to_absolute(key);
            if abs.is_dir() {
                self.sizetimes.save(key.clone(), SizeTime::Dir);
            } else if let Ok(meta) = fs::metadata(&abs) {
                if let Ok(mtime) = meta.modified() {
                    let millis = mtime
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as i64)
                        .unwrap_or(0);
                    self.sizetimes.save(
                        key.clone(),
                        SizeTime::File {
                            size: meta.len(),
                            mtime_millis: millis,
                        },
                    );
                }
            }
        }
        self.sizetimes.get(key).cloned()
    }

    /// Every path currently sharing `sizetime`, pruned of deleted paths.
    pub fn lookup_by_sizetime(&mut self, sizetime: &SizeTime) -> HashSet<RelativePath> {
        let candidates = self.sizetimes.get_by_value(sizetime);
        self.prune_deleted(candidates)
    }

    fn prune_deleted(&mut self, candidates: HashSet<RelativePath>) -> HashSet<RelativePath> {
        let mut alive = HashSet::new();
        let mut dead = Vec::new();
        for path in candidates {
            if self.to_absolute(&path).exists() {
                alive.insert(path);
            } else {
                dead.push(path);
            }
        }
        for path in dead {
            self.hashes.delete_subtree(&path);
            self.sizetimes.delete_subtree(&path);
        }
        alive
    }

    /// Registers already-known values for `key`, skipping recomputation.
    /// Directories are always normalized to the sentinel values
    /// regardless of what's passed in.
    pub fn save(&mut self, key: RelativePath, hash: String, sizetime: SizeTime) {
        let abs = self.to_absolute(&key);
        if abs.is_dir() {
            self.hashes.save(key.clone(), DIR_SENTINEL.to_string());
            self.sizetimes.save(key, SizeTime::Dir);
        } else {
            self.hashes.save(key.clone(), hash);
            self.sizetimes.save(key, sizetime);
        }
    }

    /// Forgets `key` and every path under it.
    pub fn delete(&mut self, key: &RelativePath) {
        self.hashes.delete_subtree(key);
        self.sizetimes.delete_subtree(key);
    }

    /// Moves `src` (and everything under it) to `dst`, preserving
    /// cached hash/sizetime values instead of recomputing them.
    pub fn move_path(&mut self, src: &RelativePath, dst: &RelativePath) {
        self.hashes.move_subtree(src, dst);
        self.sizetimes.move_subtree(src, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_file(path: &Path, contents: &[u8]) {
        let mut f = File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    #[test]
    fn computes_and_caches_hash_lazily() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a.txt"), b"hello");
        let mut state = LocalState::new(dir.path());
        let rel = RelativePath::new("/a.txt");
        assert!(!state.hashes.contains(&rel));
        let h = state.get_hash(&rel, true).unwrap().unwrap();
        assert!(state.hashes.contains(&rel));
        let h2 = state.get_hash(&rel, true).unwrap().unwrap();
        assert_eq!(h, h2);
    }

    #[test]
    fn directories_get_sentinel_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut state = LocalState::new(dir.path());
        let rel = RelativePath::new("/sub");
        assert_eq!(state.get_hash(&rel, true).unwrap().unwrap(), DIR_SENTINEL);
        assert_eq!(state.get_sizetime(&rel, true).unwrap(), SizeTime::Dir);
    }

    #[test]
    fn lookup_by_hash_prunes_deleted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        write_file(&a, b"same content");
        write_file(&b, b"same content");
        let mut state = LocalState::new(dir.path());
        let ra = RelativePath::new("/a.txt");
        let rb = RelativePath::new("/b.txt");
        let h = state.get_hash(&ra, true).unwrap().unwrap();
        state.get_hash(&rb, true).unwrap();
        std::fs::remove_file(&b).unwrap();
        let matches = state.lookup_by_hash(&h);
        assert_eq!(matches, [ra].into_iter().collect());
        assert!(!state.hashes.contains(&rb));
    }

    #[test]
    fn populate_by_walking_discovers_preexisting_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_file(&dir.path().join("sub/a.txt"), b"hello");
        write_file(&dir.path().join("top.txt"), b"world");

        let mut state = LocalState::new(dir.path());
        state.populate_by_walking();

        assert!(state.hashes.contains(&RelativePath::new("/sub")));
        assert!(state.hashes.contains(&RelativePath::new("/sub/a.txt")));
        assert!(state.hashes.contains(&RelativePath::new("/top.txt")));
        assert_eq!(
            state.get_hash(&RelativePath::new("/sub"), false).unwrap().unwrap(),
            DIR_SENTINEL
        );
    }

    #[test]
    fn move_path_preserves_cached_values() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a.txt"), b"hi");
        let mut state = LocalState::new(dir.path());
        let src = RelativePath::new("/a.txt");
        let h_before = state.get_hash(&src, true).unwrap().unwrap();
        std::fs::rename(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();
        let dst = RelativePath::new("/b.txt");
        state.move_path(&src, &dst);
        assert!(!state.hashes.contains(&src));
        assert_eq!(state.get_hash(&dst, false).unwrap().unwrap(), h_before);
    }
}
