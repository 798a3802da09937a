//! Credential vault for secrets at rest
//!
//! Account credentials (IMAP passwords, OAuth refresh tokens, client
//! secrets) may be stored encrypted in the environment. The vault derives
//! one AES-256-GCM key from `MAIL_GW_MASTER_SECRET` via scrypt and resolves
//! encrypted values at load time. Values not in the vault format pass
//! through unchanged so unencrypted configs keep working.
//!
//! At-rest format: `<iv-hex>:<ciphertext-hex>` with a 12-byte random nonce.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use secrecy::{ExposeSecret, SecretString};

use crate::errors::{AppError, AppResult};

/// Fixed scrypt salt; the master secret is the only secret input. Changing
/// this value invalidates every stored ciphertext.
const KDF_SALT: &[u8] = b"mail-gateway-credential-vault";
/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// Credential encryption service
///
/// Constructed once at startup and shared read-only. When no master secret
/// is configured the vault is disabled: plaintext values pass through and
/// encrypted values fail with `Auth` instead of crashing.
pub struct CredentialVault {
    cipher: Option<Aes256Gcm>,
}

impl CredentialVault {
    /// Build a vault from the optional master secret
    ///
    /// The 32-byte AES key is derived with scrypt (N=2^15, r=8, p=1). This
    /// runs once at startup; the cost is deliberate.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if key derivation fails (parameter misuse only).
    pub fn from_secret(master_secret: Option<&SecretString>) -> AppResult<Self> {
        let cipher = match master_secret {
            Some(secret) => {
                let params = scrypt::Params::new(15, 8, 1, 32)
                    .map_err(|e| AppError::Internal(format!("invalid scrypt parameters: {e}")))?;
                let mut key = [0u8; 32];
                scrypt::scrypt(
                    secret.expose_secret().as_bytes(),
                    KDF_SALT,
                    &params,
                    &mut key,
                )
                .map_err(|e| AppError::Internal(format!("scrypt key derivation failed: {e}")))?;
                let cipher = Aes256Gcm::new_from_slice(&key)
                    .map_err(|e| AppError::Internal(format!("cipher init failed: {e}")))?;
                Some(cipher)
            }
            None => None,
        };
        Ok(Self { cipher })
    }

    /// Whether a master secret is configured
    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt a plaintext credential into the at-rest format
    ///
    /// # Errors
    ///
    /// - `Auth` if the vault has no master secret
    /// - `Internal` if encryption fails
    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let cipher = self.cipher.as_ref().ok_or_else(|| {
            AppError::Auth("cannot encrypt: MAIL_GW_MASTER_SECRET is not set".to_owned())
        })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Internal(format!("encryption failed: {e}")))?;

        Ok(format!(
            "{}:{}",
            hex::encode(nonce_bytes),
            hex::encode(ciphertext)
        ))
    }

    /// Resolve a stored credential value
    ///
    /// Values in the `<iv-hex>:<ciphertext-hex>` format are decrypted; any
    /// other value is treated as plaintext and returned unchanged.
    ///
    /// # Errors
    ///
    /// - `Auth` if the value is encrypted but no master secret is set, the
    ///   key is wrong, or the payload is corrupt
    pub fn resolve(&self, stored: &str) -> AppResult<SecretString> {
        let Some((nonce_hex, ciphertext_hex)) = split_vault_format(stored) else {
            return Ok(SecretString::new(stored.to_owned().into()));
        };

        let cipher = self.cipher.as_ref().ok_or_else(|| {
            AppError::Auth(
                "credential is encrypted but MAIL_GW_MASTER_SECRET is not set".to_owned(),
            )
        })?;

        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|_| AppError::Auth("encrypted credential has invalid iv".to_owned()))?;
        let ciphertext = hex::decode(ciphertext_hex)
            .map_err(|_| AppError::Auth("encrypted credential has invalid ciphertext".to_owned()))?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| AppError::Auth("credential decryption failed (wrong key?)".to_owned()))?;

        let text = String::from_utf8(plaintext)
            .map_err(|_| AppError::Auth("decrypted credential is not valid UTF-8".to_owned()))?;
        Ok(SecretString::new(text.into()))
    }
}

/// Split a value into (iv-hex, ciphertext-hex) if it matches the vault format
///
/// The iv segment must be exactly 12 bytes of hex and the ciphertext segment
/// non-empty hex; anything else is treated as plaintext.
fn split_vault_format(value: &str) -> Option<(&str, &str)> {
    let (iv, ct) = value.split_once(':')?;
    if iv.len() != NONCE_LEN * 2 || ct.is_empty() {
        return None;
    }
    let is_hex = |s: &str| s.chars().all(|c| c.is_ascii_hexdigit());
    (is_hex(iv) && is_hex(ct)).then_some((iv, ct))
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{CredentialVault, split_vault_format};
    use crate::errors::ErrorKind;

    fn vault(secret: &str) -> CredentialVault {
        CredentialVault::from_secret(Some(&SecretString::new(secret.to_owned().into())))
            .expect("vault init")
    }

    #[test]
    fn round_trips_arbitrary_plaintext() {
        let v = vault("correct horse battery staple");
        for plaintext in ["p", "app-password-123", "пароль", "a:b:c"] {
            let stored = v.encrypt(plaintext).expect("encrypt");
            assert_ne!(stored, plaintext);
            let resolved = v.resolve(&stored).expect("decrypt");
            assert_eq!(resolved.expose_secret(), plaintext);
        }
    }

    #[test]
    fn wrong_key_fails_with_auth_not_panic() {
        let stored = vault("key-one").encrypt("secret").expect("encrypt");
        let err = vault("key-two").resolve(&stored).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn plaintext_passes_through_unchanged() {
        let v = vault("k");
        let resolved = v.resolve("plain-app-password").expect("passthrough");
        assert_eq!(resolved.expose_secret(), "plain-app-password");
    }

    #[test]
    fn encrypted_value_without_secret_is_auth_error() {
        let stored = vault("k").encrypt("secret").expect("encrypt");
        let disabled = CredentialVault::from_secret(None).expect("vault init");
        assert!(!disabled.is_enabled());
        let err = disabled.resolve(&stored).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn format_detection_requires_twelve_byte_iv() {
        assert!(split_vault_format("00112233445566778899aabb:deadbeef").is_some());
        assert!(split_vault_format("0011:deadbeef").is_none());
        assert!(split_vault_format("not-hex-but-has:colon").is_none());
        assert!(split_vault_format("plainpassword").is_none());
    }
}
