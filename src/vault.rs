//! Key vault: unseal stored credential ciphertexts for a single upstream call.
//!
//! Stored API keys are AES-256-GCM ciphertexts (random 12-byte nonce
//! prepended, base64 encoded). The symmetric master key is held in process
//! memory from startup and zeroized on drop. Unsealed cleartext is handed
//! out as a [`SecretString`] and must not outlive the upstream call it was
//! unsealed for.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use rand::RngCore;
use secrecy::SecretString;
use zeroize::Zeroizing;

/// Errors from sealing or unsealing credentials.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("master key must be 32 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("master key is neither valid base64 nor hex")]
    BadKeyEncoding,

    #[error("ciphertext is not valid base64: {0}")]
    BadCiphertext(#[from] base64::DecodeError),

    #[error("ciphertext too short")]
    TruncatedCiphertext,

    #[error("decryption failed")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,

    #[error("decrypted key is not valid UTF-8")]
    NotUtf8,
}

/// Vault holding the master encryption key.
#[derive(Clone)]
pub struct KeyVault {
    key: Zeroizing<[u8; 32]>,
}

impl KeyVault {
    /// Create a vault from raw key bytes.
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != 32 {
            return Err(VaultError::BadKeyLength(key.len()));
        }
        let mut key_array = Zeroizing::new([0u8; 32]);
        key_array.copy_from_slice(key);
        Ok(Self { key: key_array })
    }

    /// Create a vault from a base64- or hex-encoded 32-byte key.
    pub fn from_encoded(encoded: &str) -> Result<Self, VaultError> {
        let trimmed = encoded.trim();
        if let Ok(bytes) = hex::decode(trimmed) {
            if bytes.len() == 32 {
                return Self::new(&bytes);
            }
        }
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
            if bytes.len() == 32 {
                return Self::new(&bytes);
            }
            return Err(VaultError::BadKeyLength(bytes.len()));
        }
        Err(VaultError::BadKeyEncoding)
    }

    /// Generate a random master key (for provisioning tooling and tests).
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt a cleartext credential into a storable ciphertext.
    pub fn seal(&self, cleartext: &str) -> Result<String, VaultError> {
        let cipher =
            Aes256Gcm::new_from_slice(&*self.key).map_err(|_| VaultError::Encrypt)?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, cleartext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend(ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    /// Decrypt a stored ciphertext into a transient cleartext handle.
    pub fn unseal(&self, ciphertext: &str) -> Result<SecretString, VaultError> {
        let data = base64::engine::general_purpose::STANDARD.decode(ciphertext.trim())?;
        if data.len() < 12 {
            return Err(VaultError::TruncatedCiphertext);
        }

        let cipher =
            Aes256Gcm::new_from_slice(&*self.key).map_err(|_| VaultError::Decrypt)?;
        let nonce = Nonce::from_slice(&data[..12]);
        let cleartext = Zeroizing::new(
            cipher
                .decrypt(nonce, &data[12..])
                .map_err(|_| VaultError::Decrypt)?,
        );

        let s = std::str::from_utf8(&cleartext).map_err(|_| VaultError::NotUtf8)?;
        Ok(SecretString::from(s.to_string()))
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault").field("key", &"[REDACTED]").finish()
    }
}

/// Mask a credential for logs: last four characters only.
pub fn mask(cleartext: &str) -> String {
    if cleartext.len() <= 4 {
        return "…****".to_string();
    }
    let tail: String = cleartext
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", tail)
}

/// Replace any occurrence of `secrets` in `message` with `masked`.
///
/// Upstream error bodies can echo the Authorization header back; they are
/// scrubbed before the message is logged or surfaced to a client.
pub fn sanitize(message: &str, secrets: &[&str], masked: &str) -> String {
    let mut out = message.to_string();
    for secret in secrets {
        if !secret.is_empty() && out.contains(secret) {
            out = out.replace(secret, masked);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn test_vault() -> KeyVault {
        KeyVault::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let vault = test_vault();
        let sealed = vault.seal("sk-live-abcdef123456").unwrap();
        let opened = vault.unseal(&sealed).unwrap();
        assert_eq!(opened.expose_secret(), "sk-live-abcdef123456");
    }

    #[test]
    fn seal_is_nondeterministic() {
        let vault = test_vault();
        let a = vault.seal("same-key").unwrap();
        let b = vault.seal("same-key").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unseal_with_wrong_key_fails() {
        let sealed = test_vault().seal("secret").unwrap();
        let other = KeyVault::new(&[9u8; 32]).unwrap();
        assert!(matches!(other.unseal(&sealed), Err(VaultError::Decrypt)));
    }

    #[test]
    fn unseal_rejects_garbage() {
        let vault = test_vault();
        assert!(vault.unseal("not base64 at all!!!").is_err());
        assert!(matches!(
            vault.unseal("AAAA"),
            Err(VaultError::TruncatedCiphertext)
        ));
    }

    #[test]
    fn from_encoded_accepts_hex_and_base64() {
        let raw = KeyVault::generate_key();
        let hex_key = hex::encode(raw);
        let b64_key = base64::engine::general_purpose::STANDARD.encode(raw);

        let sealed = KeyVault::from_encoded(&hex_key).unwrap().seal("x").unwrap();
        let opened = KeyVault::from_encoded(&b64_key)
            .unwrap()
            .unseal(&sealed)
            .unwrap();
        assert_eq!(opened.expose_secret(), "x");
    }

    #[test]
    fn from_encoded_rejects_short_keys() {
        assert!(KeyVault::from_encoded("abcd").is_err());
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(
            KeyVault::from_encoded(&short),
            Err(VaultError::BadKeyLength(16))
        ));
    }

    #[test]
    fn debug_is_redacted() {
        let output = format!("{:?}", test_vault());
        assert!(output.contains("[REDACTED]"));
    }

    #[test]
    fn mask_shows_last_four() {
        assert_eq!(mask("sk-live-abcdef1234"), "…1234");
        assert_eq!(mask("abc"), "…****");
        assert_eq!(mask(""), "…****");
    }

    #[test]
    fn sanitize_scrubs_secrets() {
        let msg = "401 Unauthorized: key sk-live-9999 was rejected";
        let out = sanitize(msg, &["sk-live-9999"], "…9999");
        assert_eq!(out, "401 Unauthorized: key …9999 was rejected");
        assert!(!out.contains("sk-live-9999"));
    }

    #[test]
    fn sanitize_ignores_empty_secret() {
        assert_eq!(sanitize("hello", &[""], "…xxxx"), "hello");
    }
}
