//! Source accessors
//!
//! Path literals never hash as raw strings when it can be avoided: the
//! accessor that owns the path is asked for a fingerprint (cheap, available
//! when the source tree is pinned, e.g. by a lock file), and failing that
//! the path's content is hashed. Only when both fail does the raw string
//! leak into the hash, and the portability tag records that.
//!
//! Accessor calls are blocking, synchronous filesystem I/O.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rill_core::{HashDigest, HashSink};

/// Read-only access to a source tree.
pub trait SourceAccessor: Send + Sync {
    /// Ask for a cheap, stable fingerprint covering `path`.
    ///
    /// Returns the path relative to the fingerprinted root, and the
    /// fingerprint itself if the accessor has one. Accessors over unpinned
    /// trees return `None`.
    fn fingerprint(&self, path: &str) -> (String, Option<String>);

    fn exists(&self, path: &str) -> bool;

    /// Hash the content of the file or directory at `path`.
    fn hash_path(&self, path: &str) -> io::Result<HashDigest>;
}

pub type AccessorRef = Arc<dyn SourceAccessor>;

impl std::fmt::Debug for dyn SourceAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SourceAccessor")
    }
}

/// Accessor over a real filesystem root, with no fingerprint.
///
/// Files hash as their bytes; directories hash as a sorted recursive
/// manifest of `(name, kind, entry hash)` triples, so two trees with equal
/// content hash equal regardless of where they live.
pub struct FsAccessor {
    root: PathBuf,
}

impl FsAccessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsAccessor { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn hash_entry(path: &Path) -> io::Result<[u8; 32]> {
        let meta = fs::symlink_metadata(path)?;
        let mut sink = HashSink::new();
        if meta.is_dir() {
            sink.feed_tag(b'd');
            let mut entries: Vec<_> = fs::read_dir(path)?
                .collect::<io::Result<Vec<_>>>()?
                .into_iter()
                .map(|e| e.path())
                .collect();
            entries.sort();
            sink.feed_u64(entries.len() as u64);
            for entry in entries {
                let name = entry
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                sink.feed_str(&name);
                sink.feed_bytes(&Self::hash_entry(&entry)?);
            }
        } else if meta.file_type().is_symlink() {
            sink.feed_tag(b'l');
            let target = fs::read_link(path)?;
            sink.feed_str(&target.to_string_lossy());
        } else {
            sink.feed_tag(b'f');
            let bytes = fs::read(path)?;
            sink.feed_u64(bytes.len() as u64);
            sink.feed_bytes(&bytes);
        }
        Ok(sink.finish())
    }
}

impl SourceAccessor for FsAccessor {
    fn fingerprint(&self, path: &str) -> (String, Option<String>) {
        (path.to_string(), None)
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn hash_path(&self, path: &str) -> io::Result<HashDigest> {
        let digest = Self::hash_entry(&self.resolve(path))?;
        Ok(HashDigest::sha256(digest.to_vec()))
    }
}

/// Accessor wrapping another with a known fingerprint (a pinned tree).
///
/// All paths under a pinned accessor fingerprint as
/// `(fingerprint, relative path)` and stay fully portable.
pub struct PinnedAccessor {
    fingerprint: String,
    inner: AccessorRef,
}

impl PinnedAccessor {
    pub fn new(fingerprint: impl Into<String>, inner: AccessorRef) -> Self {
        PinnedAccessor {
            fingerprint: fingerprint.into(),
            inner,
        }
    }
}

impl SourceAccessor for PinnedAccessor {
    fn fingerprint(&self, path: &str) -> (String, Option<String>) {
        (path.to_string(), Some(self.fingerprint.clone()))
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn hash_path(&self, path: &str) -> io::Result<HashDigest> {
        self.inner.hash_path(path)
    }
}
