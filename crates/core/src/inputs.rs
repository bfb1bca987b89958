//! Evaluation-inputs fingerprint
//!
//! [`EvalInputs`] enumerates every piece of configuration that can change
//! the outcome of an evaluation. Its fingerprint is the cache-key prefix of
//! any persisted cache: two entries are comparable only when they were
//! produced under identical inputs.
//!
//! The encoding is canonical: every string is length-prefixed, every count
//! is a little-endian u64, the four booleans pack into a single flag byte,
//! and optional digests are marked with a presence byte. Any difference in
//! any field changes the fingerprint; identical inputs always produce the
//! identical fingerprint.

use std::collections::BTreeSet;

use crate::digest::HashSink;
use crate::hash::ContentHash;

/// Algorithm identifier carried alongside externally-supplied digests
/// (lock files, accessor fingerprints).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256 = 1,
    Blake3 = 2,
}

/// An externally-produced digest with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashDigest {
    pub algo: HashAlgorithm,
    pub bytes: Vec<u8>,
}

impl HashDigest {
    pub fn sha256(bytes: impl Into<Vec<u8>>) -> Self {
        HashDigest {
            algo: HashAlgorithm::Sha256,
            bytes: bytes.into(),
        }
    }

    fn feed(&self, sink: &mut HashSink) {
        sink.feed_tag(self.algo as u8);
        sink.feed_tag(self.bytes.len() as u8);
        sink.feed_bytes(&self.bytes);
    }
}

/// All configuration that affects evaluation semantics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EvalInputs {
    /// Language/evaluator version string.
    pub version: String,
    pub pure_eval: bool,
    pub impure_mode: bool,
    pub allow_build_imports: bool,
    pub restrict_eval: bool,
    /// Platform the evaluation targets, e.g. `x86_64-linux`.
    pub current_system: String,
    /// Ordered search-path entries. Order matters.
    pub search_path: Vec<String>,
    /// Sorted set of URIs the evaluation may fetch.
    pub allowed_uris: BTreeSet<String>,
    /// Digest of the lock file pinning external sources, if any.
    pub lock_file_hash: Option<HashDigest>,
    /// Fingerprint of the root source accessor, if pinned.
    pub root_accessor_fingerprint: Option<HashDigest>,
}

impl EvalInputs {
    /// Canonical fingerprint over every field. Pure and idempotent.
    pub fn fingerprint(&self) -> ContentHash {
        let mut sink = HashSink::new();

        sink.feed_str(&self.version);

        let mut flags = 0u8;
        if self.pure_eval {
            flags |= 0x01;
        }
        if self.impure_mode {
            flags |= 0x02;
        }
        if self.allow_build_imports {
            flags |= 0x04;
        }
        if self.restrict_eval {
            flags |= 0x08;
        }
        sink.feed_tag(flags);

        sink.feed_str(&self.current_system);

        sink.feed_u64(self.search_path.len() as u64);
        for entry in &self.search_path {
            sink.feed_str(entry);
        }

        // BTreeSet iterates sorted, so the encoding is deterministic.
        sink.feed_u64(self.allowed_uris.len() as u64);
        for uri in &self.allowed_uris {
            sink.feed_str(uri);
        }

        match &self.lock_file_hash {
            Some(h) => {
                sink.feed_bool(true);
                h.feed(&mut sink);
            }
            None => sink.feed_bool(false),
        }

        match &self.root_accessor_fingerprint {
            Some(h) => {
                sink.feed_bool(true);
                h.feed(&mut sink);
            }
            None => sink.feed_bool(false),
        }

        ContentHash::from_sink(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs() -> EvalInputs {
        EvalInputs {
            version: "2.18.0".into(),
            pure_eval: true,
            current_system: "x86_64-linux".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_deterministic() {
        assert_eq!(base_inputs().fingerprint(), base_inputs().fingerprint());
    }

    #[test]
    fn test_system_changes_fingerprint() {
        let a = base_inputs();
        let mut b = base_inputs();
        b.current_system = "aarch64-linux".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_each_flag_changes_fingerprint() {
        let base = base_inputs().fingerprint();
        for i in 0..4 {
            let mut inputs = base_inputs();
            match i {
                0 => inputs.pure_eval = !inputs.pure_eval,
                1 => inputs.impure_mode = !inputs.impure_mode,
                2 => inputs.allow_build_imports = !inputs.allow_build_imports,
                _ => inputs.restrict_eval = !inputs.restrict_eval,
            }
            assert_ne!(inputs.fingerprint(), base, "flag {i} must matter");
        }
    }

    #[test]
    fn test_search_path_order_matters() {
        let mut a = base_inputs();
        a.search_path = vec!["one".into(), "two".into()];
        let mut b = base_inputs();
        b.search_path = vec!["two".into(), "one".into()];
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_optional_digests_matter() {
        let mut with_lock = base_inputs();
        with_lock.lock_file_hash = Some(HashDigest::sha256(vec![0xAB; 32]));
        assert_ne!(with_lock.fingerprint(), base_inputs().fingerprint());

        let mut other_lock = base_inputs();
        other_lock.lock_file_hash = Some(HashDigest::sha256(vec![0xCD; 32]));
        assert_ne!(with_lock.fingerprint(), other_lock.fingerprint());
    }

    #[test]
    fn test_field_shift_does_not_collide() {
        // Without length prefixes the version could bleed into the system
        // string; make sure the framing holds.
        let mut a = base_inputs();
        a.version = "2.18".into();
        a.current_system = ".0x86_64-linux".into();
        assert_ne!(a.fingerprint(), base_inputs().fingerprint());
    }
}
