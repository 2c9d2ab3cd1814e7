//! At-rest protection for catalog metadata.
//!
//! Titles are stored as AES-256-GCM envelopes (`envelope`), tags as
//! HMAC-SHA256 blind indexes (`blind_index`). Both keys are server-only and
//! loaded once at startup.

pub mod blind_index;
pub mod envelope;

pub use blind_index::{BlindIndex, BlindIndexError};
pub use envelope::{CipherEnvelope, EnvelopeError, MetadataCipher};
