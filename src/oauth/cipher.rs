use crate::errors::{AppError, AppResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;

const KEYRING_SERVICE: &str = "business-metrics-engine";
const KEYRING_KEY_NAME: &str = "credential-encryption-key";
const NONCE_LEN: usize = 12;

/// AES-256-GCM for OAuth tokens at rest. Ciphertexts are
/// `base64(nonce || sealed bytes)`.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn from_key(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Loads the key from the OS keyring, generating and storing one on first use.
    pub fn from_keyring() -> AppResult<Self> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_KEY_NAME)
            .map_err(|error| AppError::Credential(error.to_string()))?;

        match entry.get_password() {
            Ok(value) => return Ok(Self::from_key(decode_stored_key(&value)?)),
            Err(keyring::Error::NoEntry) => {}
            Err(error) => return Err(AppError::Credential(error.to_string())),
        }

        let key: [u8; 32] = rand::random();
        let encoded = base64::engine::general_purpose::STANDARD.encode(key);
        entry
            .set_password(&encoded)
            .map_err(|error| AppError::Credential(error.to_string()))?;
        Ok(Self::from_key(key))
    }

    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|error| AppError::Internal(error.to_string()))?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|error| AppError::Internal(error.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce_bytes);
        payload.extend_from_slice(&sealed);
        Ok(base64::engine::general_purpose::STANDARD.encode(payload))
    }

    pub fn decrypt(&self, encoded: &str) -> AppResult<String> {
        let payload = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|error| AppError::Credential(format!("malformed ciphertext: {}", error)))?;
        if payload.len() <= NONCE_LEN {
            return Err(AppError::Credential("malformed ciphertext: too short".to_string()));
        }

        let (nonce_bytes, sealed) = payload.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|error| AppError::Internal(error.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| AppError::Credential("credential could not be decrypted".to_string()))?;
        String::from_utf8(plaintext).map_err(|error| AppError::Credential(error.to_string()))
    }
}

/// Decodes the keyring value. A key of the wrong size is an error and is
/// never replaced.
fn decode_stored_key(value: &str) -> AppResult<[u8; 32]> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|error| AppError::Credential(format!("stored credential key is not base64: {}", error)))?;
    <[u8; 32]>::try_from(decoded.as_slice()).map_err(|_| {
        AppError::Credential(format!(
            "stored credential key is {} bytes, expected 32; refusing to replace it",
            decoded.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::{decode_stored_key, CredentialCipher};
    use base64::Engine;

    #[test]
    fn encrypts_with_fresh_nonce_and_decrypts() {
        let cipher = CredentialCipher::from_key([7u8; 32]);
        let first = cipher.encrypt("access-token-value").expect("encrypt");
        let second = cipher.encrypt("access-token-value").expect("encrypt");

        assert_ne!(first, second);
        assert!(!first.contains("access-token-value"));
        assert_eq!(cipher.decrypt(&first).expect("decrypt"), "access-token-value");
    }

    #[test]
    fn wrong_key_is_a_credential_error() {
        let sealed = CredentialCipher::from_key([1u8; 32]).encrypt("secret").expect("encrypt");
        let error = CredentialCipher::from_key([2u8; 32])
            .decrypt(&sealed)
            .expect_err("must fail");
        assert!(error.to_string().starts_with("CREDENTIAL:"));
    }

    #[test]
    fn stored_key_of_wrong_length_is_refused() {
        let short = base64::engine::general_purpose::STANDARD.encode([9u8; 16]);
        let error = decode_stored_key(&short).expect_err("16-byte key");
        assert!(error.to_string().starts_with("CREDENTIAL:"));
        assert!(decode_stored_key("not base64!").is_err());

        let valid = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        assert_eq!(decode_stored_key(&valid).expect("32-byte key"), [9u8; 32]);
    }
}
