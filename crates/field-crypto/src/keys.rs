//! Encryption key generation and decoding
//!
//! Keys are 32 raw bytes exchanged as URL-safe base64. Trailing `=` padding is
//! accepted on input so keys produced by other tooling still load.

use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Raw key length in bytes.
pub const KEY_LEN: usize = 32;

/// Salt length for password derivation.
const SALT_LEN: usize = 16;

/// Generate a fresh random key, base64url encoded.
pub fn generate_key() -> String {
    let mut bytes = [0u8; KEY_LEN];
    rand::rng().fill(&mut bytes);
    let encoded = URL_SAFE_NO_PAD.encode(bytes);
    bytes.zeroize();
    encoded
}

/// Derive a key from an operator password with Argon2id and a random salt.
///
/// The salt is discarded, so the same password yields a different key on each
/// call. The output is meant to be stored (env var or key file), not re-derived.
pub fn derive_key(password: &str) -> Result<String> {
    if password.is_empty() {
        return Err(Error::KeyDerivation("password must not be empty".into()));
    }

    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill(&mut salt);

    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), &salt, &mut key)
        .map_err(|e| Error::KeyDerivation(e.to_string()))?;

    let encoded = URL_SAFE_NO_PAD.encode(key);
    key.zeroize();
    Ok(encoded)
}

/// Decode a base64url key into raw bytes. Caller zeroizes the result.
pub(crate) fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let trimmed = encoded.trim().trim_end_matches('=');
    let mut bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| Error::InvalidKey(format!("not base64url: {e}")))?;

    if bytes.len() != KEY_LEN {
        let len = bytes.len();
        bytes.zeroize();
        return Err(Error::InvalidKey(format!(
            "expected {KEY_LEN} bytes, got {len}"
        )));
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_decodes_to_32_bytes() {
        let key = generate_key();
        assert_eq!(key.len(), 43);
        assert!(decode_key(&key).is_ok());
    }

    #[test]
    fn generated_keys_are_unique() {
        assert_ne!(generate_key(), generate_key());
    }

    #[test]
    fn padded_key_is_accepted() {
        let key = format!("{}=", generate_key());
        assert!(decode_key(&key).is_ok());
    }

    #[test]
    fn short_key_is_rejected() {
        let short = URL_SAFE_NO_PAD.encode([7u8; 16]);
        let err = decode_key(&short).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"), "got: {err}");
    }

    #[test]
    fn garbage_key_is_rejected() {
        assert!(matches!(
            decode_key("not a key!!"),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn derived_key_is_usable_and_salted() {
        let a = derive_key("correct horse battery staple").unwrap();
        let b = derive_key("correct horse battery staple").unwrap();
        assert!(decode_key(&a).is_ok());
        assert_ne!(a, b, "random salt must make derivations differ");
    }

    #[test]
    fn empty_password_is_rejected() {
        assert!(matches!(derive_key(""), Err(Error::KeyDerivation(_))));
    }
}
