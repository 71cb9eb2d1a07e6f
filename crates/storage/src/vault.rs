//! Symmetric encryption for credentials at rest.
//!
//! Mailbox passwords, OAuth client ids and refresh tokens are stored as
//! ciphertext. Deployments that predate encryption may still hold plaintext
//! columns, so [`CryptoVault::decrypt`] is tolerant: anything that is not
//! recognizable ciphertext is returned unchanged, and writes re-encrypt such
//! values in place.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;

/// Stable marker prepended to every ciphertext produced by this vault.
const CIPHERTEXT_PREFIX: &str = "mfv1:";

const NONCE_LEN: usize = 12;

/// Environment variable holding the base64-encoded 32-byte key.
pub const ENCRYPTION_KEY_ENV: &str = "ENCRYPTION_KEY";

/// Fallback secret the key is derived from when [`ENCRYPTION_KEY_ENV`] is
/// absent (hashed with SHA-256).
pub const DERIVE_SECRET_ENV: &str = "JWT_SECRET_KEY";

const DEFAULT_DERIVE_SECRET: &str = "mailfleet_secret_key";

/// ChaCha20-Poly1305 vault keyed from the process environment.
///
/// Custom `Debug` impl never prints key material.
#[derive(Clone)]
pub struct CryptoVault {
    key: [u8; 32],
}

impl std::fmt::Debug for CryptoVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoVault")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl CryptoVault {
    /// Build the vault from `ENCRYPTION_KEY` (base64, 32 bytes). When the
    /// variable is absent or not decodable, the key is derived by hashing
    /// `JWT_SECRET_KEY` (or a built-in development secret).
    pub fn from_env() -> Self {
        if let Ok(encoded) = std::env::var(ENCRYPTION_KEY_ENV) {
            if let Ok(bytes) = BASE64.decode(encoded.trim()) {
                if let Ok(key) = <[u8; 32]>::try_from(bytes.as_slice()) {
                    return Self { key };
                }
            }
            // Not a decodable 32-byte key; treat the value itself as a secret.
            return Self::derive_from_secret(&encoded);
        }

        let secret =
            std::env::var(DERIVE_SECRET_ENV).unwrap_or_else(|_| DEFAULT_DERIVE_SECRET.to_string());
        Self::derive_from_secret(&secret)
    }

    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive a key as `SHA-256(secret)`.
    pub fn derive_from_secret(secret: &str) -> Self {
        use sha2::Digest;
        let digest = sha2::Sha256::digest(secret.as_bytes());
        Self { key: digest.into() }
    }

    /// Encrypt a credential. Empty input stays empty; already-encrypted input
    /// is returned as-is so repeated writes do not double-wrap.
    pub fn encrypt(&self, plaintext: &str) -> String {
        if plaintext.is_empty() || is_encrypted(plaintext) {
            return plaintext.to_string();
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let Ok(sealed) = cipher.encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes()) else {
            // ChaCha20-Poly1305 only fails on absurd input sizes; keep the
            // value usable rather than corrupting it.
            return plaintext.to_string();
        };

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);

        format!("{CIPHERTEXT_PREFIX}{}", BASE64.encode(payload))
    }

    /// Decrypt a credential. Input without the ciphertext marker, or that
    /// fails authentication, is returned unchanged — this is what lets legacy
    /// plaintext rows keep working until the migration pass rewrites them.
    pub fn decrypt(&self, input: &str) -> String {
        let Some(encoded) = input.strip_prefix(CIPHERTEXT_PREFIX) else {
            return input.to_string();
        };

        let Ok(payload) = BASE64.decode(encoded) else {
            return input.to_string();
        };
        if payload.len() <= NONCE_LEN {
            return input.to_string();
        }

        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        match cipher.decrypt(Nonce::from_slice(nonce), sealed) {
            Ok(plain) => String::from_utf8(plain).unwrap_or_else(|_| input.to_string()),
            Err(_) => input.to_string(),
        }
    }

    /// Encrypt only when the value is non-empty plaintext.
    pub fn ensure_encrypted(&self, value: &str) -> String {
        if value.is_empty() || is_encrypted(value) {
            value.to_string()
        } else {
            self.encrypt(value)
        }
    }
}

/// Whether a stored value carries the vault's ciphertext marker.
pub fn is_encrypted(text: &str) -> bool {
    text.starts_with(CIPHERTEXT_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> CryptoVault {
        CryptoVault::derive_from_secret("unit-test-secret")
    }

    #[test]
    fn encrypt_roundtrip() {
        let vault = test_vault();
        let ciphertext = vault.encrypt("hunter2");
        assert_ne!(ciphertext, "hunter2");
        assert!(is_encrypted(&ciphertext));
        assert_eq!(vault.decrypt(&ciphertext), "hunter2");
    }

    #[test]
    fn encrypt_is_randomized() {
        let vault = test_vault();
        let a = vault.encrypt("same input");
        let b = vault.encrypt("same input");
        assert_ne!(a, b);
        assert_eq!(vault.decrypt(&a), vault.decrypt(&b));
    }

    #[test]
    fn decrypt_returns_legacy_plaintext_unchanged() {
        let vault = test_vault();
        assert_eq!(vault.decrypt("plain-password"), "plain-password");
        assert_eq!(vault.decrypt(""), "");
    }

    #[test]
    fn decrypt_with_wrong_key_returns_input() {
        let ciphertext = test_vault().encrypt("secret");
        let other = CryptoVault::derive_from_secret("another-secret");
        assert_eq!(other.decrypt(&ciphertext), ciphertext);
    }

    #[test]
    fn encrypt_empty_stays_empty() {
        let vault = test_vault();
        assert_eq!(vault.encrypt(""), "");
        assert!(!is_encrypted(""));
    }

    #[test]
    fn encrypt_does_not_double_wrap() {
        let vault = test_vault();
        let once = vault.encrypt("token");
        let twice = vault.encrypt(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn garbage_after_marker_is_tolerated() {
        let vault = test_vault();
        assert_eq!(vault.decrypt("mfv1:!!!not-base64!!!"), "mfv1:!!!not-base64!!!");
        assert_eq!(vault.decrypt("mfv1:QUJD"), "mfv1:QUJD");
    }
}
