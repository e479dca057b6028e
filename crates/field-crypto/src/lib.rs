//! Field-level encryption and fingerprinting for proxy URLs
//!
//! Proxy URLs carry credentials, so they are sealed before they reach disk and
//! opened again on read. This crate has no knowledge of the pool; the identity
//! store applies it at its persistence boundary.
//!
//! - `FieldCipher` seals values as `enc:<base64url(nonce || ciphertext)>` and
//!   skips values that are already sealed.
//! - Opening a corrupt value yields `DECRYPTION_ERROR` instead of failing, so a
//!   single bad row never breaks a listing.
//! - `fingerprint()` is the deterministic SHA-256 digest used for uniqueness.
//! - `generate_key()` / `derive_key()` produce keys for `FieldCipher`.

pub mod cipher;
pub mod error;
pub mod fingerprint;
pub mod keys;

pub use cipher::{DECRYPTION_ERROR, ENCRYPTED_PREFIX, FieldCipher, FieldEncryptor, is_encrypted};
pub use error::{Error, Result};
pub use fingerprint::fingerprint;
pub use keys::{KEY_LEN, derive_key, generate_key};
