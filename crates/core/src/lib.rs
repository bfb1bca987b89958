//! Rill Core: hashing primitives for the Rill evaluator
//!
//! This crate is the dependency-free foundation of the content-addressed
//! memoization subsystem. It knows nothing about expressions, values, or
//! environments; it provides the typed digests everything above it speaks:
//!
//! - `digest`: streaming SHA-256 sink with the canonical feed encodings
//!   (length-prefixed strings, little-endian integers, float
//!   canonicalization)
//! - `hash`: the [`StructuralHash`]/[`ContentHash`] wrapper pair,
//!   back-references for cycles, and the [`Portability`] classification
//! - `inputs`: the [`EvalInputs`] fingerprint used as persisted-cache
//!   key prefix
//! - `counter`: cache-line-aligned atomic counters for force-path stats

pub mod counter;
pub mod digest;
pub mod hash;
pub mod inputs;

pub use counter::Counter;
pub use digest::{DIGEST_SIZE, DigestBytes, HashSink, canonical_f64_bits};
pub use hash::{
    ContentHash, ContentHashResult, HashResult, Portability, StructuralHash, StructuralHashResult,
};
pub use inputs::{EvalInputs, HashAlgorithm, HashDigest};
