//! At-rest encryption for the `secret` column
//!
//! A single application-wide passphrase is stretched with Argon2 into an
//! AES-256-GCM key once, at startup. Every encryption draws a fresh random
//! 96-bit nonce, so encrypting the same key twice yields different rows.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use common::Secret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Fixed salt for deriving the application key from the passphrase.
const KEY_SALT: &[u8] = b"credential-pool/secret-cipher/v1";

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// An encrypted secret as stored in a credential row (base64 fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub nonce: String,
    pub ciphertext: String,
}

/// Authenticated encryption for credential secrets.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Derive the cipher key from the application passphrase.
    ///
    /// Argon2 is deliberately slow; build one cipher per process and share
    /// it behind an `Arc`.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::KeyDerivation("passphrase must not be empty".into()));
        }

        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), KEY_SALT, &mut key)
            .map_err(|e| Error::KeyDerivation(e.to_string()))?;

        let cipher = Aes256Gcm::new_from_slice(&key);
        key.zeroize();
        let cipher = cipher.map_err(|e| Error::KeyDerivation(format!("invalid key length: {e}")))?;

        Ok(Self { cipher })
    }

    /// Encrypt a plaintext API key under a fresh nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("AES-GCM encryption failed: {e}")))?;

        Ok(EncryptedSecret {
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    /// Decrypt a stored secret. The plaintext never leaves a `Secret`.
    pub fn decrypt(&self, encrypted: &EncryptedSecret) -> Result<Secret<String>> {
        let nonce_bytes = STANDARD
            .decode(&encrypted.nonce)
            .map_err(|e| Error::Crypto(format!("malformed nonce: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(Error::Crypto(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(&encrypted.ciphertext)
            .map_err(|e| Error::Crypto(format!("malformed ciphertext: {e}")))?;

        let mut plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| {
                Error::Crypto("AES-GCM decryption failed (wrong passphrase or tampered row)".into())
            })?;

        match String::from_utf8(plaintext.clone()) {
            Ok(secret) => {
                plaintext.zeroize();
                Ok(Secret::new(secret))
            }
            Err(e) => {
                plaintext.zeroize();
                Err(Error::Crypto(format!("decrypted secret is not UTF-8: {e}")))
            }
        }
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

/// Short, non-reversible identifier for a plaintext key.
///
/// First 12 hex chars of SHA-256. Lets operators tell keys apart in
/// diagnostics without ever printing the key itself.
pub fn fingerprint(plaintext: &str) -> String {
    Sha256::digest(plaintext.as_bytes())
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_passphrase("correct horse battery staple").unwrap()
    }

    #[test]
    fn encrypt_then_decrypt_returns_plaintext() {
        let c = cipher();
        let stored = c.encrypt("AIzaSy-example-key").unwrap();
        assert_ne!(stored.ciphertext, "AIzaSy-example-key");
        let secret = c.decrypt(&stored).unwrap();
        assert_eq!(secret.expose_str(), "AIzaSy-example-key");
    }

    #[test]
    fn nonces_are_fresh_per_encryption() {
        let c = cipher();
        let a = c.encrypt("same-key").unwrap();
        let b = c.encrypt("same-key").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_passphrase_fails_to_decrypt() {
        let stored = cipher().encrypt("AIzaSy-example-key").unwrap();
        let other = SecretCipher::from_passphrase("another passphrase").unwrap();
        let err = other.decrypt(&stored).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)), "got: {err:?}");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let c = cipher();
        let mut stored = c.encrypt("AIzaSy-example-key").unwrap();
        let mut raw = STANDARD.decode(&stored.ciphertext).unwrap();
        raw[0] ^= 0xff;
        stored.ciphertext = STANDARD.encode(raw);
        assert!(c.decrypt(&stored).is_err());
    }

    #[test]
    fn short_nonce_is_rejected() {
        let c = cipher();
        let mut stored = c.encrypt("k").unwrap();
        stored.nonce = STANDARD.encode([0u8; 4]);
        let err = c.decrypt(&stored).unwrap_err();
        assert!(err.to_string().contains("nonce must be 12 bytes"), "got: {err}");
    }

    #[test]
    fn empty_passphrase_rejected() {
        let err = SecretCipher::from_passphrase("").unwrap_err();
        assert!(matches!(err, Error::KeyDerivation(_)));
    }

    #[test]
    fn same_passphrase_derives_same_key() {
        let stored = cipher().encrypt("shared").unwrap();
        assert_eq!(cipher().decrypt(&stored).unwrap().expose_str(), "shared");
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = fingerprint("AIzaSy-example-key");
        assert_eq!(a.len(), 12);
        assert_eq!(a, fingerprint("AIzaSy-example-key"));
        assert_ne!(a, fingerprint("AIzaSy-other-key"));
        assert!(!a.contains("AIza"));
    }

    #[test]
    fn debug_does_not_leak_key_material() {
        assert_eq!(format!("{:?}", cipher()), "SecretCipher { .. }");
    }
}
