//! Caller identity: verification of signed WebApp init data issued by the
//! chat platform, plus the extractor that pulls the raw token off a request.

pub mod constant_time;
pub mod extract;
pub mod init_data;

pub use init_data::{AuthError, IdentityVerifier, VerifiedIdentity};
