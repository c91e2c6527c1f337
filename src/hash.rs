//! Deterministic content and configuration hashing (C1).
//!
//! Pure functions, no I/O, no shared state. SHA-256 is mandated so hashes
//! remain stable across platforms and Rust versions.

use crate::data::ContentHash;
use sha2::{Digest, Sha256};

/// Hash a single byte slice.
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentHash(hasher.finalize().into())
}

/// Hash several parts as one domain-separated digest. A `\0` separator is
/// written between parts (and after the last one) so that `hash_many(&[a,
/// b])` cannot collide with `hash_many(&[ab])` purely through concatenation.
pub fn hash_many(parts: &[&[u8]]) -> ContentHash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
        hasher.update([0u8]);
    }
    ContentHash(hasher.finalize().into())
}

/// Convenience wrapper for hashing UTF-8 strings.
pub fn hash_str(s: &str) -> ContentHash {
    hash_bytes(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_is_deterministic() {
        assert_eq!(hash_bytes(b"hello").to_hex(), hash_bytes(b"hello").to_hex());
    }

    #[test]
    fn hash_many_is_order_sensitive() {
        let a = hash_many(&[b"a", b"b"]);
        let b = hash_many(&[b"b", b"a"]);
        assert_ne!(a.to_hex(), b.to_hex());
    }

    #[test]
    fn hash_many_separates_domains() {
        // "ab" split as ["a","b"] must not collide with ["ab"].
        let split = hash_many(&[b"a", b"b"]);
        let whole = hash_many(&[b"ab"]);
        assert_ne!(split.to_hex(), whole.to_hex());
    }
}
