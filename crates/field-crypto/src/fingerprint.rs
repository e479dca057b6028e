//! Deterministic URL fingerprints

use sha2::{Digest, Sha256};

/// Length of a fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 64;

/// Lowercase hex SHA-256 of the URL.
///
/// Used only to enforce uniqueness of sealed URLs, since two seals of the same
/// URL never compare equal. Never reversed.
pub fn fingerprint(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}
