//! Envelope encryption: AES-256-GCM under a per-envelope key derived from
//! the master key.
//!
//! Each envelope gets a fresh random salt; its key is
//! `HMAC-SHA256(master, "kidsafe-envelope-v1" || salt)`. The ciphertext
//! carries the 12-byte nonce as a prefix.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{IntegrityError, KidsafeError, VaultError};
use crate::hex;

type HmacSha256 = Hmac<Sha256>;

pub const ENVELOPE_VERSION: u32 = 1;
const KDF_CONTEXT: &[u8] = b"kidsafe-envelope-v1";
const KDF_PREFIX: &str = "hmac-sha256:";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Opaque encrypted payload covering a record's sensitive fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub version: u32,
    pub key_derivation: String,
    pub field_count: usize,
    /// Hex SHA-256 of the plaintext payload.
    pub checksum: String,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data))
}

/// Seals and opens envelopes. Holds only the master key; every call derives
/// its own envelope key, so one instance is safe to share across threads.
#[derive(Clone)]
pub struct FieldCipher {
    master: [u8; 32],
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    fn derive(&self, salt: &[u8]) -> Result<Aes256Gcm, VaultError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.master).map_err(|e| {
            VaultError::EncryptFailed {
                message: format!("key derivation: {}", e),
            }
        })?;
        mac.update(KDF_CONTEXT);
        mac.update(salt);
        let key = mac.finalize().into_bytes();
        Aes256Gcm::new_from_slice(&key).map_err(|e| VaultError::EncryptFailed {
            message: format!("cipher init: {}", e),
        })
    }

    /// Encrypt `plaintext`, which holds `field_count` serialized fields.
    pub fn seal(
        &self,
        plaintext: &[u8],
        field_count: usize,
    ) -> Result<EncryptedEnvelope, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let cipher = self.derive(&salt)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| VaultError::EncryptFailed {
                message: e.to_string(),
            })?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&sealed);

        Ok(EncryptedEnvelope {
            ciphertext,
            version: ENVELOPE_VERSION,
            key_derivation: format!("{}{}", KDF_PREFIX, STANDARD.encode(salt)),
            field_count,
            checksum: sha256_hex(plaintext),
        })
    }

    /// Decrypt and check the payload checksum. Field-count checks belong to
    /// the caller, which knows how the payload is structured.
    pub fn open(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, KidsafeError> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(IntegrityError::UnsupportedVersion {
                version: envelope.version,
            }
            .into());
        }
        let salt_b64 = envelope
            .key_derivation
            .strip_prefix(KDF_PREFIX)
            .ok_or_else(|| VaultError::MalformedEnvelope {
                message: format!("unknown key derivation '{}'", envelope.key_derivation),
            })?;
        let salt = STANDARD
            .decode(salt_b64)
            .map_err(|e| VaultError::MalformedEnvelope {
                message: format!("salt is not valid base64: {}", e),
            })?;
        if envelope.ciphertext.len() < NONCE_LEN {
            return Err(VaultError::MalformedEnvelope {
                message: "ciphertext shorter than nonce".into(),
            }
            .into());
        }

        let cipher = self.derive(&salt)?;
        let (nonce_bytes, sealed) = envelope.ciphertext.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|e| IntegrityError::AuthenticationFailed {
                message: e.to_string(),
            })?;

        if sha256_hex(&plaintext) != envelope.checksum {
            return Err(IntegrityError::ChecksumMismatch.into());
        }
        Ok(plaintext)
    }
}
