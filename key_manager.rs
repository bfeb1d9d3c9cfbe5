//! Password-based key derivation and the per-session key store.
//!
//! This module provides [`KeyManager`], which holds at most one 256-bit key
//! derived from the logged-in user's password and salt.
//!
//! ## Security Features
//!
//! - PBKDF2-HMAC-SHA256 with 100,000 iterations
//! - Keys are zeroized on drop and on [`KeyManager::clear`]
//! - Salts come from the OS RNG via `OsRng`
//! - The key is never persisted

use crate::error::{Result, VfsError};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of derived keys in bytes
pub const KEY_LEN: usize = 32;

/// Length of per-user salts in bytes
pub const SALT_LEN: usize = 32;

/// PBKDF2 iteration count
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// A 256-bit symmetric key derived from a password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DerivedKey([REDACTED])")
    }
}

/// Derive a key from `password` and `salt`.
///
/// Deterministic: the same inputs always give the same key, which is what
/// lets previously written frames be decrypted after the next login.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<DerivedKey> {
    if password.is_empty() {
        return Err(VfsError::authentication("password must not be empty"));
    }
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    let derived = DerivedKey(key);
    key.zeroize();
    Ok(derived)
}

/// Generate a fresh random salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Holds the derived key for the active session.
#[derive(Default)]
pub struct KeyManager {
    key: Option<DerivedKey>,
}

impl KeyManager {
    /// Create an empty key store with no key loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive and store the session key, replacing (and wiping) any previous one.
    pub fn load(&mut self, password: &str, salt: &[u8]) -> Result<()> {
        let key = derive_key(password, salt)?;
        self.clear();
        self.key = Some(key);
        info!("session key loaded");
        Ok(())
    }

    /// Wipe the key buffer and mark the store as empty.
    pub fn clear(&mut self) {
        if let Some(mut key) = self.key.take() {
            key.zeroize();
            debug!("session key cleared");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.key.is_some()
    }

    pub(crate) fn key(&self) -> Result<&DerivedKey> {
        self.key
            .as_ref()
            .ok_or_else(|| VfsError::authentication("no key loaded"))
    }

    #[cfg(test)]
    pub(crate) fn with_key(key: DerivedKey) -> Self {
        Self { key: Some(key) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = derive_key("pw1234", &salt).unwrap();
        let b = derive_key("pw1234", &salt).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_salt_or_password_changes_key() {
        let a = derive_key("pw1234", &[1u8; SALT_LEN]).unwrap();
        let b = derive_key("pw1234", &[2u8; SALT_LEN]).unwrap();
        let c = derive_key("pw12345", &[1u8; SALT_LEN]).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn empty_password_is_rejected() {
        let err = derive_key("", &[0u8; SALT_LEN]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn load_and_clear_lifecycle() {
        let mut km = KeyManager::new();
        assert!(!km.is_loaded());
        assert!(km.key().is_err());

        km.load("secret", &generate_salt()).unwrap();
        assert!(km.is_loaded());
        assert!(km.key().is_ok());

        km.clear();
        assert!(!km.is_loaded());
        assert_eq!(km.key().unwrap_err().kind(), ErrorKind::Authentication);
    }

    #[test]
    fn failed_load_keeps_store_empty() {
        let mut km = KeyManager::new();
        assert!(km.load("", &generate_salt()).is_err());
        assert!(!km.is_loaded());
    }

    #[test]
    fn salts_are_random() {
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn debug_redacts_key() {
        let key = DerivedKey::from_bytes([0xAB; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "DerivedKey([REDACTED])");
    }
}
