use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;

/// Ciphertext/IV pair as stored by the API layer (both base64).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedSecret {
    pub ciphertext: String,
    pub iv: String,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("credential encryption key is not configured")]
    MissingKey,
    #[error("credential encryption key is invalid: {0}")]
    InvalidKey(String),
    #[error("stored secret is malformed: {0}")]
    Malformed(String),
    #[error("stored secret failed authentication")]
    Decrypt,
}

/// AEAD secret box shared with the API layer. Holds no key when the worker
/// runs without `CREDENTIALS_AES_KEY`; every open then fails with `MissingKey`.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Option<Aes256Gcm>,
}

impl SecretBox {
    pub fn from_key_material(raw: Option<&str>) -> Result<Self, CryptoError> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(Self { cipher: None });
        };
        let key = decode_key(raw)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn open(&self, secret: &EncryptedSecret) -> Result<String, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::MissingKey)?;
        let iv = BASE64
            .decode(secret.iv.trim())
            .map_err(|err| CryptoError::Malformed(format!("iv: {err}")))?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::Malformed(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        let ciphertext = BASE64
            .decode(secret.ciphertext.trim())
            .map_err(|err| CryptoError::Malformed(format!("ciphertext: {err}")))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plain).map_err(|err| CryptoError::Malformed(err.to_string()))
    }

    #[cfg(test)]
    pub fn seal(&self, plaintext: &str, iv: [u8; IV_LEN]) -> Result<EncryptedSecret, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::MissingKey)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(EncryptedSecret {
            ciphertext: BASE64.encode(ciphertext),
            iv: BASE64.encode(iv),
        })
    }
}

fn decode_key(raw: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = if raw.len() == KEY_LEN * 2 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(raw).map_err(|err| CryptoError::InvalidKey(err.to_string()))?
    } else {
        BASE64
            .decode(raw)
            .map_err(|err| CryptoError::InvalidKey(err.to_string()))?
    };
    if bytes.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "expected {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
pub(crate) fn test_box() -> SecretBox {
    SecretBox::from_key_material(Some(&"ab".repeat(KEY_LEN))).unwrap()
}
