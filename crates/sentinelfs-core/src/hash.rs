//! Content hashing.
//!
//! Default implementation of the Dropbox content-hash algorithm:
//! split the file into 4 MiB blocks, SHA-256 each block, then SHA-256
//! the concatenation of those block digests. Directories never get
//! hashed by content; callers use [`DIR_SENTINEL`][crate::state::DIR_SENTINEL]
//! for them instead.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

const BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A pluggable hash function: given an absolute path, return its
/// content hash, or `None` if the path no longer exists (the caller
/// distinguishes directories before invoking this, so implementations
/// only need to handle regular files).
pub trait HashFn: Send + Sync {
    fn hash(&self, absolute_path: &Path) -> Result<Option<String>, HashError>;
}

/// The default content hasher, matching the Dropbox "content_hash" API
/// field algorithm byte for byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropboxHasher;

impl HashFn for DropboxHasher {
    fn hash(&self, absolute_path: &Path) -> Result<Option<String>, HashError> {
        dropbox_hash(absolute_path)
    }
}

/// Computes the Dropbox-compatible content hash of the file at
/// `absolute_path`. Returns `Ok(None)` if the file has since
/// disappeared (a race between discovery and read, not an error
/// worth propagating).
pub fn dropbox_hash(absolute_path: &Path) -> Result<Option<String>, HashError> {
    let mut file = match File::open(absolute_path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(HashError::Io {
                path: absolute_path.display().to_string(),
                source: e,
            })
        }
    };

    let mut overall = Sha256::new();
    let mut block = Sha256::new();
    let mut block_pos = 0usize;
    let mut buf = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).map_err(|e| HashError::Io {
            path: absolute_path.display().to_string(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        let mut consumed = 0;
        while consumed < n {
            if block_pos == BLOCK_SIZE {
                overall.update(block.finalize_reset());
                block_pos = 0;
            }
            let space = BLOCK_SIZE - block_pos;
            let take = space.min(n - consumed);
            block.update(&buf[consumed..consumed + take]);
            block_pos += take;
            consumed += take;
        }
    }
    if block_pos > 0 {
        overall.update(block.finalize());
    }

    Ok(Some(format!("{:x}", overall.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hashes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        File::create(&path).unwrap();
        let h = dropbox_hash(&path).unwrap().unwrap();
        // sha256("") of zero blocks, per the Dropbox algorithm.
        assert_eq!(
            h,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hash_is_stable_and_content_dependent() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"hello world").unwrap();
        std::fs::write(&b, b"hello there").unwrap();
        let ha = dropbox_hash(&a).unwrap().unwrap();
        let ha2 = dropbox_hash(&a).unwrap().unwrap();
        let hb = dropbox_hash(&b).unwrap().unwrap();
        assert_eq!(ha, ha2);
        assert_ne!(ha, hb);
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        assert!(dropbox_hash(&path).unwrap().is_none());
    }

    #[test]
    fn hash_spans_multiple_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let mut f = File::create(&path).unwrap();
        let chunk = vec![0xABu8; 1024 * 1024];
        for _ in 0..5 {
            f.write_all(&chunk).unwrap();
        }
        let h = dropbox_hash(&path).unwrap().unwrap();
        assert_eq!(h.len(), 64);
    }
}
