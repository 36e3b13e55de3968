//! Optional end-to-end encryption capability.
//!
//! Nothing in the delivery path assumes encryption is active. When an
//! [`EncryptionLayer`] is configured, outgoing bodies are sealed for the
//! recipient before they leave the device and incoming bodies are opened
//! with the owner's key before they reach the cache.

use std::sync::Arc;

use crate::errors::{CourierError, Result};
use crate::ids::ContactId;

/// Pluggable cipher.
pub trait Encryptor: Send + Sync {
    /// Seal `plaintext` for the holder of `recipient_key`.
    fn encrypt(&self, plaintext: &str, recipient_key: &str) -> Result<String>;
    /// Open `ciphertext` addressed to the holder of `own_key`.
    fn decrypt(&self, ciphertext: &str, own_key: &str) -> Result<String>;
}

/// Key lookup for the encryption layer.
pub trait KeyDirectory: Send + Sync {
    /// Public key of `contact`, if known.
    fn recipient_key(&self, contact: &ContactId) -> Option<String>;
    /// The local account's private key material.
    fn own_key(&self) -> String;
}

/// An encryptor paired with the keys it needs.
#[derive(Clone)]
pub struct EncryptionLayer {
    encryptor: Arc<dyn Encryptor>,
    keys: Arc<dyn KeyDirectory>,
}

impl std::fmt::Debug for EncryptionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionLayer").finish_non_exhaustive()
    }
}

impl EncryptionLayer {
    /// Pair an encryptor with a key directory.
    pub fn new(encryptor: Arc<dyn Encryptor>, keys: Arc<dyn KeyDirectory>) -> Self {
        Self { encryptor, keys }
    }

    /// Seal an outgoing body for `recipient`.
    pub fn seal(&self, recipient: &ContactId, plaintext: &str) -> Result<String> {
        let key = self.keys.recipient_key(recipient).ok_or_else(|| {
            CourierError::validation(format!("no encryption key for {recipient}"))
        })?;
        self.encryptor.encrypt(plaintext, &key)
    }

    /// Open an incoming body.
    pub fn open(&self, ciphertext: &str) -> Result<String> {
        self.encryptor.decrypt(ciphertext, &self.keys.own_key())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Tags the body with the key; enough to check plumbing.
    struct Tagging;

    impl Encryptor for Tagging {
        fn encrypt(&self, plaintext: &str, recipient_key: &str) -> Result<String> {
            Ok(format!("{recipient_key}|{plaintext}"))
        }

        fn decrypt(&self, ciphertext: &str, own_key: &str) -> Result<String> {
            ciphertext
                .strip_prefix(&format!("{own_key}|"))
                .map(str::to_owned)
                .ok_or_else(|| CourierError::internal("wrong key"))
        }
    }

    struct Keys;

    impl KeyDirectory for Keys {
        fn recipient_key(&self, contact: &ContactId) -> Option<String> {
            (contact.as_str() == "bob").then(|| "bob-key".to_string())
        }

        fn own_key(&self) -> String {
            "bob-key".to_string()
        }
    }

    fn layer() -> EncryptionLayer {
        EncryptionLayer::new(Arc::new(Tagging), Arc::new(Keys))
    }

    #[test]
    fn seal_then_open() {
        let layer = layer();
        let sealed = layer.seal(&"bob".into(), "hi").unwrap();
        assert_ne!(sealed, "hi");
        assert_eq!(layer.open(&sealed).unwrap(), "hi");
    }

    #[test]
    fn missing_recipient_key_is_validation_error() {
        let err = layer().seal(&"carol".into(), "hi").unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        assert!(layer().open("someone-else|hi").is_err());
    }
}
