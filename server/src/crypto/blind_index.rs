//! Deterministic keyed tokens for equality-only tag search.
//!
//! `token = hex(HMAC-SHA256(key, lowercase(trim(tag))))`. The store only ever
//! sees tokens; lookups are exact matches against the 64-char hex string.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex length of an HMAC-SHA256 digest. The `video_tag_tokens` schema
/// enforces the same length.
pub const TOKEN_HEX_LEN: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlindIndexError {
    #[error("tag is empty after normalization")]
    EmptyTag,
    #[error("no usable tags in input")]
    NoTags,
}

#[derive(Clone)]
pub struct BlindIndex {
    key: Vec<u8>,
}

/// Trim and lowercase. Ingestion and querying must both go through this.
pub fn normalize_tag(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl BlindIndex {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    /// Tokenize one discrete tag.
    pub fn tokenize(&self, raw_tag: &str) -> Result<String, BlindIndexError> {
        let normalized = normalize_tag(raw_tag);
        if normalized.is_empty() {
            return Err(BlindIndexError::EmptyTag);
        }
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(normalized.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Split a comma-separated tag list and tokenize each tag on its own.
    /// Blank entries are skipped and duplicates (after normalization) collapse.
    pub fn tokenize_list(&self, raw_tags: &str) -> Result<Vec<String>, BlindIndexError> {
        let mut tokens: Vec<String> = Vec::new();
        for tag in raw_tags.split(',') {
            if normalize_tag(tag).is_empty() {
                continue;
            }
            let token = self.tokenize(tag)?;
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
        if tokens.is_empty() {
            return Err(BlindIndexError::NoTags);
        }
        Ok(tokens)
    }
}

/// Shape check for a stored or client-supplied token.
pub fn is_valid_token(token: &str) -> bool {
    token.len() == TOKEN_HEX_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
