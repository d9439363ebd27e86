//! Relative path handling.
//!
//! The original Python implementation threads raw `/`-prefixed strings
//! through every component. We keep the same on-the-wire representation
//! (it is what gets hashed into `DualIndex` keys and printed in events)
//! but wrap it in a type so ancestor/descendant checks live in one place
//! instead of being re-derived with string slicing at each call site.

use std::fmt;
use std::path::{Path, PathBuf};

/// A `/`-rooted path relative to the watched directory, e.g. `/a/b.txt`.
///
/// Always starts with `/`, never ends with `/` unless it is the root
/// itself (`/`). Segments are compared verbatim; no case-folding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativePath(String);

impl RelativePath {
    /// Builds a `RelativePath` from a raw string, normalizing it to
    /// start with exactly one leading `/` and carry no trailing `/`
    /// (except for the root path itself).
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref();
        let mut s = if raw.starts_with('/') {
            raw.to_string()
        } else {
            format!("/{raw}")
        };
        while s.len() > 1 && s.ends_with('/') {
            s.pop();
        }
        if s == "/." {
            s = "/".to_string();
        }
        RelativePath(s)
    }

    /// Computes the relative path of `absolute` under `root`.
    pub fn from_absolute(root: &Path, absolute: &Path) -> Self {
        let rel = absolute.strip_prefix(root).unwrap_or(absolute);
        let s = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
        RelativePath::new(format!("/{s}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Joins this relative path onto an absolute root, producing the
    /// absolute filesystem path.
    pub fn to_absolute(&self, root: &Path) -> PathBuf {
        let trimmed = self.0.trim_start_matches('/');
        root.join(trimmed)
    }

    /// `true` if `self` is `other`, or a path strictly under `other`
    /// (i.e. `other` is an ancestor of, or equal to, `self`).
    pub fn is_same_or_descendant_of(&self, other: &RelativePath) -> bool {
        if self.0 == other.0 {
            return true;
        }
        let prefix = if other.0 == "/" {
            "/".to_string()
        } else {
            format!("{}/", other.0)
        };
        self.0.starts_with(&prefix)
    }

    /// `true` if `other` is a strict descendant of `self`.
    pub fn is_strict_ancestor_of(&self, other: &RelativePath) -> bool {
        self != other && other.is_same_or_descendant_of(self)
    }

    /// Rewrites `self` by replacing the `src` prefix with `dst`, as used
    /// when a subtree is moved/renamed. Panics if `self` is not under
    /// `src`; callers only invoke this after filtering with
    /// [`RelativePath::is_same_or_descendant_of`].
    pub fn rebase(&self, src: &RelativePath, dst: &RelativePath) -> RelativePath {
        debug_assert!(self.is_same_or_descendant_of(src));
        let suffix = &self.0[src.0.len()..];
        RelativePath::new(format!("{}{}", dst.0, suffix))
    }

    /// Parent path, or `None` if this is the root.
    pub fn parent(&self) -> Option<RelativePath> {
        if self.0 == "/" {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(RelativePath::new("/")),
            Some(idx) => Some(RelativePath::new(&self.0[..idx])),
            None => None,
        }
    }

    /// Final path segment (file or directory name).
    pub fn basename(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RelativePath {
    fn from(s: &str) -> Self {
        RelativePath::new(s)
    }
}

impl From<String> for RelativePath {
    fn from(s: String) -> Self {
        RelativePath::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_missing_leading_slash_and_trailing_slash() {
        assert_eq!(RelativePath::new("a/b").as_str(), "/a/b");
        assert_eq!(RelativePath::new("/a/b/").as_str(), "/a/b");
        assert_eq!(RelativePath::new("/").as_str(), "/");
    }

    #[test]
    fn degenerate_dot_normalizes_to_root() {
        assert_eq!(RelativePath::new("/.").as_str(), "/");
    }

    #[test]
    fn descendant_check_does_not_match_sibling_prefixes() {
        let dir = RelativePath::new("/a/b");
        let sibling = RelativePath::new("/a/bcd");
        assert!(!sibling.is_same_or_descendant_of(&dir));
        let child = RelativePath::new("/a/b/c.txt");
        assert!(child.is_same_or_descendant_of(&dir));
        assert!(dir.is_same_or_descendant_of(&dir));
    }

    #[test]
    fn rebase_replaces_prefix() {
        let src = RelativePath::new("/old/dir");
        let dst = RelativePath::new("/new/name");
        let child = RelativePath::new("/old/dir/file.txt");
        assert_eq!(child.rebase(&src, &dst).as_str(), "/new/name/file.txt");
        assert_eq!(src.rebase(&src, &dst).as_str(), "/new/name");
    }

    #[test]
    fn parent_and_basename() {
        let p = RelativePath::new("/a/b/c.txt");
        assert_eq!(p.parent().unwrap().as_str(), "/a/b");
        assert_eq!(p.basename(), "c.txt");
        assert_eq!(RelativePath::new("/top").parent().unwrap().as_str(), "/");
        assert!(RelativePath::new("/").parent().is_none());
    }
}
