//! Streaming digest sink for eval-time hashing
//!
//! Every hash in the evaluator is built by feeding bytes into a [`HashSink`]
//! and finishing it. The feed helpers enforce the two encoding rules that
//! keep hashes unambiguous and machine-independent:
//!
//! - Variable-sized inputs are length-prefixed with a little-endian u64, so
//!   `["ab", "c"]` and `["a", "bc"]` produce different byte streams.
//! - All integers are encoded little-endian, so big-endian and little-endian
//!   machines agree on every hash.
//!
//! Each composite construct additionally writes a single-byte type tag
//! before its body; the tag values live with the constructs that own them
//! (expression hashing, env hashing, value serialization).

use sha2::{Digest, Sha256};

/// Number of bytes in an eval-time digest (SHA-256).
pub const DIGEST_SIZE: usize = 32;

/// Raw digest bytes.
pub type DigestBytes = [u8; DIGEST_SIZE];

/// A streaming SHA-256 sink with the evaluator's canonical encodings.
pub struct HashSink {
    inner: Sha256,
}

impl HashSink {
    pub fn new() -> Self {
        HashSink {
            inner: Sha256::new(),
        }
    }

    /// Feed raw bytes with no framing. Callers are responsible for
    /// unambiguity; prefer the typed helpers below.
    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    /// Feed a single-byte type tag.
    pub fn feed_tag(&mut self, tag: u8) {
        self.inner.update([tag]);
    }

    /// Feed a bool as one byte (1/0).
    pub fn feed_bool(&mut self, v: bool) {
        self.inner.update([u8::from(v)]);
    }

    /// Feed a u32 little-endian.
    pub fn feed_u32(&mut self, v: u32) {
        self.inner.update(v.to_le_bytes());
    }

    /// Feed a u64 little-endian.
    pub fn feed_u64(&mut self, v: u64) {
        self.inner.update(v.to_le_bytes());
    }

    /// Feed an i64 little-endian.
    pub fn feed_i64(&mut self, v: i64) {
        self.inner.update(v.to_le_bytes());
    }

    /// Feed an i32 little-endian.
    pub fn feed_i32(&mut self, v: i32) {
        self.inner.update(v.to_le_bytes());
    }

    /// Feed a string length-prefixed (little-endian u64 length, then bytes).
    pub fn feed_str(&mut self, s: &str) {
        self.feed_u64(s.len() as u64);
        self.inner.update(s.as_bytes());
    }

    /// Feed a canonicalized f64.
    ///
    /// Canonicalization collapses every NaN bit pattern to the quiet NaN of
    /// `f64::NAN` and folds `-0.0` into `+0.0`, then feeds the IEEE-754 bit
    /// pattern little-endian. Two floats that compare equal (or are both
    /// NaN) always feed identical bytes.
    pub fn feed_f64(&mut self, v: f64) {
        self.feed_u64(canonical_f64_bits(v));
    }

    /// Finish the digest and return the raw bytes.
    pub fn finish(self) -> DigestBytes {
        self.inner.finalize().into()
    }
}

impl Default for HashSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical bit pattern for a float being hashed or serialized.
pub fn canonical_f64_bits(v: f64) -> u64 {
    let canon = if v.is_nan() {
        f64::NAN
    } else if v == 0.0 {
        0.0
    } else {
        v
    };
    canon.to_bits()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefix_disambiguates() {
        let mut a = HashSink::new();
        a.feed_str("ab");
        a.feed_str("c");

        let mut b = HashSink::new();
        b.feed_str("a");
        b.feed_str("bc");

        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_known_sha256() {
        let mut sink = HashSink::new();
        sink.feed_bytes(b"hello");
        assert_eq!(
            hex::encode(sink.finish()),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_float_canonicalization() {
        let mut pos = HashSink::new();
        pos.feed_f64(0.0);
        let mut neg = HashSink::new();
        neg.feed_f64(-0.0);
        assert_eq!(pos.finish(), neg.finish());

        let quiet = canonical_f64_bits(f64::NAN);
        let weird_nan = f64::from_bits(0x7ff8_0000_dead_beef);
        assert!(weird_nan.is_nan());
        assert_eq!(canonical_f64_bits(weird_nan), quiet);
    }

    #[test]
    fn test_integers_are_little_endian() {
        let mut sink = HashSink::new();
        sink.feed_u64(0x0102_0304_0506_0708);
        let mut manual = HashSink::new();
        manual.feed_bytes(&[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(sink.finish(), manual.finish());
    }
}
