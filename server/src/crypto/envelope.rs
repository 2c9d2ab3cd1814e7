//! AES-256-GCM envelopes for encrypted catalog fields.
//!
//! Wire format: standard base64 of compact JSON
//! `{"v":1,"alg":"A256GCM","iv_b64":"<12-byte nonce>","ct_b64":"<ciphertext || 16-byte tag>"}`.
//! Anything else is rejected whole; nothing is partially parsed.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const ENVELOPE_VERSION: u32 = 1;
pub const ENVELOPE_ALGORITHM: &str = "A256GCM";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Operators see which case occurred; callers get the same generic error for both.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
    #[error("decryption failed (tampered ciphertext or wrong key)")]
    DecryptionFailed,
}

/// Parsed envelope. Only version 1 / A256GCM decrypts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    pub version: u32,
    pub algorithm: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    v: u32,
    alg: String,
    iv_b64: String,
    ct_b64: String,
}

impl CipherEnvelope {
    /// Decode the stored base64(JSON) form.
    pub fn from_wire(encoded: &str) -> Result<Self, EnvelopeError> {
        let json = B64
            .decode(encoded.trim())
            .map_err(|_| EnvelopeError::InvalidEnvelope("outer base64"))?;
        let wire: WireEnvelope = serde_json::from_slice(&json)
            .map_err(|_| EnvelopeError::InvalidEnvelope("json shape"))?;
        let nonce = B64
            .decode(&wire.iv_b64)
            .map_err(|_| EnvelopeError::InvalidEnvelope("iv base64"))?;
        let ciphertext = B64
            .decode(&wire.ct_b64)
            .map_err(|_| EnvelopeError::InvalidEnvelope("ct base64"))?;

        Ok(Self {
            version: wire.v,
            algorithm: wire.alg,
            nonce,
            ciphertext,
        })
    }

    pub fn to_wire(&self) -> String {
        let wire = WireEnvelope {
            v: self.version,
            alg: self.algorithm.clone(),
            iv_b64: B64.encode(&self.nonce),
            ct_b64: B64.encode(&self.ciphertext),
        };
        let json = serde_json::to_vec(&wire).expect("envelope serializes to JSON");
        B64.encode(json)
    }
}

/// Server-side cipher for metadata fields. Holds the single symmetric key.
#[derive(Clone)]
pub struct MetadataCipher {
    cipher: Aes256Gcm,
}

impl MetadataCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt with a fresh random nonce. Used by ingestion only.
    pub fn encrypt(&self, plaintext: &str) -> CipherEnvelope {
        let nonce_bytes: [u8; NONCE_LEN] = rand::rng().random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .expect("AES-256-GCM encryption should not fail");

        CipherEnvelope {
            version: ENVELOPE_VERSION,
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        }
    }

    pub fn encrypt_to_wire(&self, plaintext: &str) -> String {
        self.encrypt(plaintext).to_wire()
    }

    pub fn decrypt(&self, envelope: &CipherEnvelope) -> Result<String, EnvelopeError> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::InvalidEnvelope("unsupported version"));
        }
        if envelope.algorithm != ENVELOPE_ALGORITHM {
            return Err(EnvelopeError::InvalidEnvelope("unsupported algorithm"));
        }
        if envelope.nonce.len() != NONCE_LEN {
            return Err(EnvelopeError::InvalidEnvelope("nonce length"));
        }
        if envelope.ciphertext.len() < TAG_LEN {
            return Err(EnvelopeError::InvalidEnvelope("ciphertext shorter than tag"));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
            .map_err(|_| EnvelopeError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| EnvelopeError::InvalidEnvelope("plaintext not utf-8"))
    }

    /// Parse and decrypt a stored field in one step.
    pub fn decrypt_wire(&self, encoded: &str) -> Result<String, EnvelopeError> {
        self.decrypt(&CipherEnvelope::from_wire(encoded)?)
    }
}
