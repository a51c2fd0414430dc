//! Identifier and credential-hash helpers.
//!
//! Ids are UUID v4 rendered as 32 lowercase hex characters (128 bits of OS
//! CSPRNG randomness). Credentials (session tokens, API keys) are never
//! stored in plaintext — they are SHA-256 hashed before persisting, and
//! lookup is by hash.

use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

/// Generate a new 32-hex-character id.
#[must_use]
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Hash a plaintext credential with SHA-256, returning the hex-encoded hash.
///
/// This is a one-way operation. The plaintext cannot be recovered.
#[must_use]
pub fn hash_credential(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    hex::encode(digest)
}

/// Word pool for human-readable ids. Short, common, unambiguous words.
const WORDS: &[&str] = &[
    "amber", "apple", "arrow", "basil", "beach", "birch", "blue", "breeze",
    "brick", "brook", "cedar", "chalk", "cloud", "coral", "creek", "crow",
    "dawn", "delta", "drift", "dusk", "ember", "fern", "flint", "fog",
    "gale", "glade", "grove", "hazel", "heron", "ivy", "jade", "lark",
    "lilac", "lime", "maple", "marsh", "mist", "moss", "north", "oak",
    "ochre", "olive", "onyx", "opal", "otter", "pearl", "pine", "plum",
    "quartz", "rain", "reed", "ridge", "river", "rose", "rust", "sage",
    "slate", "snow", "spark", "stone", "storm", "thorn", "tide", "wren",
];

/// Generate a hyphen-joined human-readable id of `n` words
/// (e.g. `cedar-blue-river`).
#[must_use]
pub fn words(n: usize) -> String {
    let mut rng = rand::thread_rng();
    let picked: Vec<&str> = (0..n.max(1))
        .filter_map(|_| WORDS.choose(&mut rng).copied())
        .collect();
    picked.join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_32_hex_chars() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn hash_is_stable_and_hex() {
        let h1 = hash_credential("token");
        let h2 = hash_credential("token");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_credential("other"));
    }

    #[test]
    fn words_joins_with_hyphens() {
        let w = words(3);
        assert_eq!(w.split('-').count(), 3);
    }

    #[test]
    fn words_zero_is_clamped_to_one() {
        let w = words(0);
        assert_eq!(w.split('-').count(), 1);
    }
}
