//! Typed hash wrappers and portability classification
//!
//! Two incompatible newtypes wrap the raw digest so that the identity of an
//! unforced construct (expression, environment, thunk) can never be confused
//! with the identity of a forced value:
//!
//! - [`StructuralHash`]: fingerprint of an unevaluated construct's shape.
//! - [`ContentHash`]: fingerprint of a forced value's content.
//!
//! Both support placeholder and back-reference constructors for cycle
//! handling. A back-ref encodes "same as the ancestor `depth` levels up";
//! its category tag differs between the two wrappers, so a structural
//! back-ref at depth d never collides with a content back-ref at depth d.

use crate::digest::{DIGEST_SIZE, DigestBytes, HashSink};

/// Magic prefix byte for back-reference hashes. Keeps back-refs out of the
/// image of ordinary content hashing.
const BACKREF_PREFIX: u8 = 0xFF;

const STRUCTURAL_TAG: u8 = 0x01;
const CONTENT_TAG: u8 = 0x02;

fn back_ref_digest(depth: usize, category: u8) -> DigestBytes {
    let mut data = [0u8; 10];
    data[0] = BACKREF_PREFIX;
    data[1] = category;
    data[2..10].copy_from_slice(&(depth as u64).to_le_bytes());
    let mut sink = HashSink::new();
    sink.feed_bytes(&data);
    sink.finish()
}

fn combine_digests<I: IntoIterator<Item = DigestBytes>>(parts: I) -> DigestBytes {
    let mut sink = HashSink::new();
    for part in parts {
        sink.feed_bytes(&part);
    }
    sink.finish()
}

macro_rules! eval_hash_type {
    ($(#[$doc:meta])* $name:ident, $category:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub DigestBytes);

        impl $name {
            /// The zeroed placeholder hash, used for null or invalid nodes.
            /// All placeholders of one category compare equal.
            pub fn placeholder() -> Self {
                $name([0u8; DIGEST_SIZE])
            }

            /// Back-reference hash for a cycle: identifies "the ancestor
            /// `depth` levels up the current hashing stack". Depth is part
            /// of the identity, so isomorphic cycles hash equal regardless
            /// of pointer identity.
            pub fn back_ref(depth: usize) -> Self {
                $name(back_ref_digest(depth, $category))
            }

            /// Feed each constituent hash, in order, into a fresh digest.
            pub fn combine<I: IntoIterator<Item = Self>>(parts: I) -> Self {
                $name(combine_digests(parts.into_iter().map(|h| h.0)))
            }

            /// Hash a string's bytes.
            pub fn from_str_bytes(s: &str) -> Self {
                let mut sink = HashSink::new();
                sink.feed_bytes(s.as_bytes());
                $name(sink.finish())
            }

            /// Hash raw bytes.
            pub fn from_bytes(bytes: &[u8]) -> Self {
                let mut sink = HashSink::new();
                sink.feed_bytes(bytes);
                $name(sink.finish())
            }

            /// Wrap a finished sink.
            pub fn from_sink(sink: HashSink) -> Self {
                $name(sink.finish())
            }

            pub fn as_bytes(&self) -> &DigestBytes {
                &self.0
            }

            /// Lowercase hex rendering (64 characters).
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }
    };
}

eval_hash_type!(
    /// Identity of an unforced construct: expression, environment frame, or
    /// thunk. Used as the memoization key.
    StructuralHash,
    STRUCTURAL_TAG
);

eval_hash_type!(
    /// Identity of a forced value's content. Stable across runs and
    /// machines when its portability tag is [`Portability::Portable`].
    ContentHash,
    CONTENT_TAG
);

/// How broadly a hash is reproducible.
///
/// The variants form a total order under "least portable wins"; only
/// `Portable` hashes may be written to a persistent cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Portability {
    /// Stable across runs and machines. Safe for persistent caching.
    Portable,
    /// Depends on a live memory address. Stable only within one run.
    NonPortablePointer,
    /// Depends on a per-evaluation ID (e.g. a position index).
    NonPortableSessionLocal,
    /// Depends on a machine-local filesystem path with no fingerprint.
    NonPortableRawPath,
}

impl Portability {
    pub fn is_portable(self) -> bool {
        matches!(self, Portability::Portable)
    }

    /// Monoid combine: `Portable` is the identity; otherwise the left
    /// operand is retained.
    pub fn combine(self, other: Portability) -> Portability {
        if self.is_portable() { other } else { self }
    }
}

/// A hash paired with the portability of the traversal that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashResult<H> {
    pub hash: H,
    pub portability: Portability,
}

impl<H> HashResult<H> {
    pub fn new(hash: H, portability: Portability) -> Self {
        HashResult { hash, portability }
    }

    pub fn is_portable(&self) -> bool {
        self.portability.is_portable()
    }
}

pub type ContentHashResult = HashResult<ContentHash>;
pub type StructuralHashResult = HashResult<StructuralHash>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_ref_depth_is_identity() {
        assert_eq!(StructuralHash::back_ref(3), StructuralHash::back_ref(3));
        assert_ne!(StructuralHash::back_ref(1), StructuralHash::back_ref(2));
    }

    #[test]
    fn test_back_ref_categories_never_collide() {
        for depth in 0..16 {
            assert_ne!(
                StructuralHash::back_ref(depth).0,
                ContentHash::back_ref(depth).0
            );
        }
    }

    #[test]
    fn test_placeholder_is_zeroed() {
        assert_eq!(ContentHash::placeholder().0, [0u8; DIGEST_SIZE]);
        assert_eq!(ContentHash::placeholder(), ContentHash::placeholder());
    }

    #[test]
    fn test_combine_is_order_sensitive() {
        let a = ContentHash::from_str_bytes("a");
        let b = ContentHash::from_str_bytes("b");
        assert_ne!(ContentHash::combine([a, b]), ContentHash::combine([b, a]));
    }

    #[test]
    fn test_portability_monoid() {
        use Portability::*;
        assert_eq!(Portable.combine(NonPortableRawPath), NonPortableRawPath);
        assert_eq!(NonPortableRawPath.combine(Portable), NonPortableRawPath);
        assert_eq!(
            NonPortablePointer.combine(NonPortableSessionLocal),
            NonPortablePointer
        );
        assert_eq!(Portable.combine(Portable), Portable);
    }

    #[test]
    fn test_hex_rendering() {
        let h = ContentHash::from_str_bytes("hello");
        assert_eq!(
            h.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(h.to_hex().len(), 64);
    }
}
