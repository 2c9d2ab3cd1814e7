//! WebApp init data verification.
//!
//! The platform signs the init data with a key derived from the bot token:
//! `secret = HMAC-SHA256(key = "WebAppData", msg = bot_token)` and
//! `hash = hex(HMAC-SHA256(key = secret, msg = data_check_string))`, where the
//! check string is every field except `hash`, sorted by name, rendered as
//! `name=value` and joined with `\n`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::auth::constant_time::constant_time_eq;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_FIELD: &str = "hash";
const AUTH_DATE_FIELD: &str = "auth_date";
const USER_FIELD: &str = "user";
const KEY_DERIVATION_LABEL: &[u8] = b"WebAppData";

/// Identity proven by a valid init data token. Request-scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: i64,
    pub issued_at: i64,
}

/// Why a token was rejected. Logged server-side only; callers see a single
/// `Unauthenticated` response for every variant.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("identity token missing")]
    MissingToken,
    #[error("identity token is not valid form data")]
    Malformed,
    #[error("signature field missing")]
    MissingSignature,
    #[error("signature field is not a 32-byte hex digest")]
    MalformedSignature,
    #[error("auth_date missing")]
    MissingAuthDate,
    #[error("auth_date is not a positive integer")]
    InvalidAuthDate,
    #[error("auth_date is in the future")]
    IssuedInFuture,
    #[error("token age {age}s exceeds {max_age}s")]
    Expired { age: i64, max_age: u64 },
    #[error("user payload missing")]
    MissingUser,
    #[error("user payload has no positive numeric id")]
    InvalidUser,
    #[error("signature mismatch")]
    SignatureMismatch,
}

#[derive(Deserialize)]
struct UserPayload {
    id: i64,
}

/// Verifies init data against one platform secret. The derived key is
/// computed once at construction.
#[derive(Clone)]
pub struct IdentityVerifier {
    derived_key: [u8; 32],
    max_age_secs: u64,
}

impl IdentityVerifier {
    pub fn new(platform_secret: &str, max_age_secs: u64) -> Self {
        Self {
            derived_key: derive_secret_key(platform_secret),
            max_age_secs,
        }
    }

    pub fn max_age_secs(&self) -> u64 {
        self.max_age_secs
    }

    /// Verify a token against the current wall clock.
    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<VerifiedIdentity, AuthError> {
        verify_with_key(&self.derived_key, token, self.max_age_secs, now)
    }
}

/// One-shot verification for callers holding the raw platform secret.
pub fn verify(
    token: &str,
    platform_secret: &str,
    max_age_secs: u64,
    now: DateTime<Utc>,
) -> Result<VerifiedIdentity, AuthError> {
    verify_with_key(&derive_secret_key(platform_secret), token, max_age_secs, now)
}

fn verify_with_key(
    derived_key: &[u8; 32],
    token: &str,
    max_age_secs: u64,
    now: DateTime<Utc>,
) -> Result<VerifiedIdentity, AuthError> {
    if token.trim().is_empty() {
        return Err(AuthError::MissingToken);
    }
    let mut fields = parse_fields(token)?;

    // Structural checks first: none of these touch key material.
    let declared_hex = fields
        .remove(SIGNATURE_FIELD)
        .ok_or(AuthError::MissingSignature)?;
    let declared = hex::decode(&declared_hex).map_err(|_| AuthError::MalformedSignature)?;
    if declared.len() != 32 {
        return Err(AuthError::MalformedSignature);
    }

    let issued_at = fields
        .get(AUTH_DATE_FIELD)
        .ok_or(AuthError::MissingAuthDate)?
        .parse::<i64>()
        .map_err(|_| AuthError::InvalidAuthDate)?;
    if issued_at <= 0 {
        return Err(AuthError::InvalidAuthDate);
    }
    let age = now.timestamp() - issued_at;
    if age < 0 {
        return Err(AuthError::IssuedInFuture);
    }
    if age as u64 > max_age_secs {
        return Err(AuthError::Expired {
            age,
            max_age: max_age_secs,
        });
    }

    let user: UserPayload = serde_json::from_str(
        fields.get(USER_FIELD).ok_or(AuthError::MissingUser)?,
    )
    .map_err(|_| AuthError::InvalidUser)?;
    if user.id <= 0 {
        return Err(AuthError::InvalidUser);
    }

    let computed = compute_signature(derived_key, &data_check_string(&fields));
    if !constant_time_eq(&computed, &declared) {
        return Err(AuthError::SignatureMismatch);
    }

    Ok(VerifiedIdentity {
        user_id: user.id,
        issued_at,
    })
}

/// Parse the token into a sorted map. Repeated field names are rejected so a
/// second value can never shadow the signed one.
fn parse_fields(token: &str) -> Result<BTreeMap<String, String>, AuthError> {
    let mut fields = BTreeMap::new();
    for (name, value) in url::form_urlencoded::parse(token.trim().as_bytes()) {
        if name.is_empty() {
            return Err(AuthError::Malformed);
        }
        if fields.insert(name.into_owned(), value.into_owned()).is_some() {
            return Err(AuthError::Malformed);
        }
    }
    Ok(fields)
}

/// Fields (signature already removed) joined as `name=value` lines in key order.
fn data_check_string(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn derive_secret_key(platform_secret: &str) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(KEY_DERIVATION_LABEL).expect("HMAC accepts any key length");
    mac.update(platform_secret.as_bytes());
    mac.finalize().into_bytes().into()
}

fn compute_signature(derived_key: &[u8; 32], check_string: &str) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(derived_key).expect("HMAC accepts any key length");
    mac.update(check_string.as_bytes());
    mac.finalize().into_bytes().into()
}

/// Build a signed init data string the way the platform does.
/// Used by local tooling and integration tests to mint tokens.
pub fn issue_init_data(platform_secret: &str, fields: &[(&str, &str)]) -> String {
    let map: BTreeMap<String, String> = fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let signature = compute_signature(
        &derive_secret_key(platform_secret),
        &data_check_string(&map),
    );

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in fields {
        serializer.append_pair(name, value);
    }
    serializer.append_pair(SIGNATURE_FIELD, &hex::encode(signature));
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BOT_TOKEN: &str = "7000000001:AAtestTOKENforUNITtests";

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000, 0).unwrap()
    }

    fn token_at(auth_date: i64) -> String {
        let auth_date = auth_date.to_string();
        issue_init_data(
            BOT_TOKEN,
            &[
                ("query_id", "AAHdF6IQAAAAAN0XohDhrOrc"),
                ("user", r#"{"id":279058397,"first_name":"Vlad","username":"vdkfrost"}"#),
                ("auth_date", &auth_date),
            ],
        )
    }

    fn verifier() -> IdentityVerifier {
        IdentityVerifier::new(BOT_TOKEN, 86400)
    }

    #[test]
    fn test_valid_token_verifies() {
        let identity = verifier().verify_at(&token_at(1_759_999_000), now()).unwrap();
        assert_eq!(identity.user_id, 279058397);
        assert_eq!(identity.issued_at, 1_759_999_000);
    }

    #[test]
    fn test_verify_is_idempotent() {
        let token = token_at(1_759_999_000);
        let first = verifier().verify_at(&token, now()).unwrap();
        let second = verifier().verify_at(&token, now()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_free_function_matches_verifier() {
        let token = token_at(1_759_999_000);
        assert_eq!(
            verify(&token, BOT_TOKEN, 86400, now()).unwrap(),
            verifier().verify_at(&token, now()).unwrap()
        );
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let fields = [
            ("auth_date", "1759999000"),
            ("user", r#"{"id":42}"#),
            ("chat_type", "private"),
        ];
        let mut reversed = fields;
        reversed.reverse();
        let a = issue_init_data(BOT_TOKEN, &fields);
        let b = issue_init_data(BOT_TOKEN, &reversed);
        assert_eq!(verifier().verify_at(&a, now()).unwrap().user_id, 42);
        assert_eq!(verifier().verify_at(&b, now()).unwrap().user_id, 42);
    }

    #[test]
    fn test_every_single_bit_flip_in_signature_rejected() {
        let token = token_at(1_759_999_000);
        let (body, hash) = token.rsplit_once("&hash=").unwrap();
        let raw = hex::decode(hash).unwrap();
        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut flipped = raw.clone();
                flipped[byte] ^= 1 << bit;
                let forged = format!("{}&hash={}", body, hex::encode(&flipped));
                assert_eq!(
                    verifier().verify_at(&forged, now()),
                    Err(AuthError::SignatureMismatch)
                );
            }
        }
    }

    #[test]
    fn test_tampered_field_rejected() {
        let token = token_at(1_759_999_000).replace("279058397", "279058398");
        assert_eq!(
            verifier().verify_at(&token, now()),
            Err(AuthError::SignatureMismatch)
        );
    }

    #[test]
    fn test_wrong_bot_token_rejected() {
        let other = IdentityVerifier::new("another:token", 86400);
        assert_eq!(
            other.verify_at(&token_at(1_759_999_000), now()),
            Err(AuthError::SignatureMismatch)
        );
    }

    #[test]
    fn test_expired_token_rejected() {
        let two_days_ago = now().timestamp() - 2 * 86400;
        assert!(matches!(
            verifier().verify_at(&token_at(two_days_ago), now()),
            Err(AuthError::Expired { .. })
        ));
    }

    #[test]
    fn test_age_exactly_max_accepted() {
        let edge = now().timestamp() - 86400;
        assert!(verifier().verify_at(&token_at(edge), now()).is_ok());
    }

    #[test]
    fn test_future_token_rejected() {
        assert_eq!(
            verifier().verify_at(&token_at(now().timestamp() + 5), now()),
            Err(AuthError::IssuedInFuture)
        );
    }

    #[test]
    fn test_structural_failures() {
        let v = verifier();
        assert_eq!(v.verify_at("", now()), Err(AuthError::MissingToken));
        assert_eq!(
            v.verify_at("auth_date=1759999000&user=%7B%22id%22%3A1%7D", now()),
            Err(AuthError::MissingSignature)
        );
        assert_eq!(
            v.verify_at("auth_date=1&hash=zz", now()),
            Err(AuthError::MalformedSignature)
        );

        let hash = "00".repeat(32);
        assert_eq!(
            v.verify_at(&format!("user=%7B%22id%22%3A1%7D&hash={}", hash), now()),
            Err(AuthError::MissingAuthDate)
        );
        assert_eq!(
            v.verify_at(&format!("auth_date=abc&hash={}", hash), now()),
            Err(AuthError::InvalidAuthDate)
        );
        assert_eq!(
            v.verify_at(&format!("auth_date=0&hash={}", hash), now()),
            Err(AuthError::InvalidAuthDate)
        );
        assert_eq!(
            v.verify_at(&format!("auth_date=1759999000&hash={}", hash), now()),
            Err(AuthError::MissingUser)
        );
        assert_eq!(
            v.verify_at(&format!("auth_date=1&auth_date=2&hash={}", hash), now()),
            Err(AuthError::Malformed)
        );
    }

    #[test]
    fn test_non_positive_user_id_rejected() {
        for user in [r#"{"id":0}"#, r#"{"id":-5}"#, r#"{"name":"x"}"#, "not json"] {
            let token = issue_init_data(BOT_TOKEN, &[("auth_date", "1759999000"), ("user", user)]);
            assert_eq!(
                verifier().verify_at(&token, now()),
                Err(AuthError::InvalidUser),
                "user payload {}",
                user
            );
        }
    }

    #[test]
    fn test_data_check_string_format() {
        let mut fields = BTreeMap::new();
        fields.insert("user".to_string(), "{}".to_string());
        fields.insert("auth_date".to_string(), "1".to_string());
        fields.insert("query_id".to_string(), "q".to_string());
        assert_eq!(data_check_string(&fields), "auth_date=1\nquery_id=q\nuser={}");
    }
}
