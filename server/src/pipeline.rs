//! Per-request delivery pipeline.
//!
//! verify identity -> admit under the rate limit -> query the catalog ->
//! decrypt titles -> sign object URLs -> shape the response.
//! Each stage returns early on failure; no signed URL leaves a failed call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::assets::{format_created_at, CatalogStore, FeedCursor, StoreError};
use crate::auth::IdentityVerifier;
use crate::config::{Config, ConfigError, Secrets};
use crate::crypto::{BlindIndex, EnvelopeError, MetadataCipher};
use crate::db::models::AssetRecord;
use crate::db::DbPool;
use crate::error::PipelineError;
use crate::presign::{SignedUrlGrant, UrlSigner, MAX_EXPIRES_SECS};
use crate::ratelimit::{Admission, RateLimiter, RateRule, RequestLedger, SqliteLedger};

pub const FEED_ENDPOINT: &str = "feed";
pub const PLAY_ENDPOINT: &str = "play";
pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 50;

/// Tunables pulled from `Config`, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_token_age_secs: u64,
    pub feed_rule: RateRule,
    pub play_rule: RateRule,
    pub url_ttl_secs: u64,
    pub refresh_lead_secs: u64,
    pub store_timeout: Duration,
}

/// Longest accepted rate-limit window. Ledger arithmetic is done in epoch
/// milliseconds and must not overflow.
pub const MAX_WINDOW_SECS: u64 = 86_400;
/// Upper bound on a single ledger or catalog call.
pub const MAX_STORE_TIMEOUT_MS: u64 = 60_000;

impl PipelineSettings {
    /// Range-checks the tunables so a bad value stops startup instead of
    /// failing every request later.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        check_range("delivery.url_ttl_secs", config.delivery.url_ttl_secs, 1, MAX_EXPIRES_SECS)?;
        check_range(
            "delivery.refresh_lead_secs",
            config.delivery.refresh_lead_secs,
            0,
            config.delivery.url_ttl_secs - 1,
        )?;
        check_range(
            "delivery.store_timeout_ms",
            config.delivery.store_timeout_ms,
            1,
            MAX_STORE_TIMEOUT_MS,
        )?;
        check_range("limits.window_secs", config.limits.window_secs, 1, MAX_WINDOW_SECS)?;
        check_range(
            "limits.feed_per_window",
            config.limits.feed_per_window.into(),
            1,
            u32::MAX.into(),
        )?;
        check_range(
            "limits.play_per_window",
            config.limits.play_per_window.into(),
            1,
            u32::MAX.into(),
        )?;
        Ok(Self::build(config))
    }

    fn build(config: &Config) -> Self {
        Self {
            max_token_age_secs: config.auth.max_age_secs,
            feed_rule: RateRule {
                limit: config.limits.feed_per_window,
                window_secs: config.limits.window_secs,
            },
            play_rule: RateRule {
                limit: config.limits.play_per_window,
                window_secs: config.limits.window_secs,
            },
            url_ttl_secs: config.delivery.url_ttl_secs,
            refresh_lead_secs: config.delivery.refresh_lead_secs,
            store_timeout: Duration::from_millis(config.delivery.store_timeout_ms),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::build(&Config::default())
    }
}

fn check_range(name: &'static str, actual: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&actual) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            min,
            max,
            actual,
        })
    }
}

/// Query string of the feed endpoint. It is parsed only after the caller is
/// verified and admitted, so a malformed one never outranks a bad token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedQuery {
    pub tag: Option<String>,
    pub cursor_created_at: Option<String>,
    pub cursor_id: Option<String>,
    pub limit: Option<String>,
}

impl FeedQuery {
    /// Unknown parameters (such as `initData`) are ignored. A repeated known
    /// parameter is a bad request.
    pub fn parse(raw: Option<&str>) -> Result<Self, PipelineError> {
        let mut query = FeedQuery::default();
        let Some(raw) = raw else {
            return Ok(query);
        };
        for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            let slot = match name.as_ref() {
                "tag" => &mut query.tag,
                "cursorCreatedAt" => &mut query.cursor_created_at,
                "cursorId" => &mut query.cursor_id,
                "limit" => &mut query.limit,
                _ => continue,
            };
            if slot.replace(value.into_owned()).is_some() {
                return Err(PipelineError::BadRequest(
                    "query parameters must not repeat".to_string(),
                ));
            }
        }
        Ok(query)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    pub created_at: String,
    pub duration_seconds: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub thumb_url: String,
    pub thumb_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub ok: bool,
    pub server_time: DateTime<Utc>,
    pub url_ttl_seconds: u64,
    pub refresh_lead_seconds: u64,
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<FeedCursor>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayResponse {
    pub ok: bool,
    pub server_time: DateTime<Utc>,
    pub url_ttl_seconds: u64,
    pub refresh_lead_seconds: u64,
    pub id: String,
    pub title: String,
    pub duration_seconds: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub video_url: String,
    pub video_expires_at: DateTime<Utc>,
    pub thumb_url: String,
    pub thumb_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RequestPipeline {
    verifier: IdentityVerifier,
    limiter: RateLimiter,
    index: BlindIndex,
    cipher: MetadataCipher,
    /// None when object store credentials are not configured
    signer: Option<UrlSigner>,
    catalog: CatalogStore,
    settings: PipelineSettings,
}

impl RequestPipeline {
    pub fn new(
        secrets: &Secrets,
        settings: PipelineSettings,
        signer: Option<UrlSigner>,
        db: DbPool,
    ) -> Self {
        let ledger = Arc::new(SqliteLedger::new(db.clone()));
        Self::with_ledger(secrets, settings, signer, db, ledger)
    }

    /// Same as `new`, with the request ledger supplied by the caller.
    pub fn with_ledger(
        secrets: &Secrets,
        settings: PipelineSettings,
        signer: Option<UrlSigner>,
        db: DbPool,
        ledger: Arc<dyn RequestLedger>,
    ) -> Self {
        let limiter = RateLimiter::new(ledger, settings.store_timeout);
        Self {
            verifier: IdentityVerifier::new(&secrets.platform_secret, settings.max_token_age_secs),
            limiter,
            index: BlindIndex::new(&secrets.tag_key),
            cipher: MetadataCipher::new(&secrets.metadata_key),
            signer,
            catalog: CatalogStore::new(db),
            settings,
        }
    }

    /// `raw_query` is the undecoded query string of the request, if any.
    pub async fn feed(
        &self,
        token: &str,
        raw_query: Option<&str>,
    ) -> Result<FeedResponse, PipelineError> {
        self.feed_at(token, raw_query, Utc::now()).await
    }

    pub async fn feed_at(
        &self,
        token: &str,
        raw_query: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FeedResponse, PipelineError> {
        let identity_id = self.authenticate(token, now)?;
        self.admit(identity_id, FEED_ENDPOINT, self.settings.feed_rule, now)
            .await?;

        let query = FeedQuery::parse(raw_query)?;
        let limit = parse_limit(query.limit.as_deref())?;
        let cursor = parse_cursor(query.cursor_created_at, query.cursor_id)?;
        // The store only ever sees the token, never the search term
        let tag_token = match query.tag.as_deref().map(str::trim) {
            Some(tag) if !tag.is_empty() => Some(
                self.index
                    .tokenize(tag)
                    .map_err(|e| PipelineError::BadRequest(e.to_string()))?,
            ),
            _ => None,
        };

        let page = self
            .run_catalog(move |catalog| {
                catalog.list_published(tag_token.as_deref(), cursor.as_ref(), limit)
            })
            .await?;

        let signer = self.signer()?;
        let mut items = Vec::with_capacity(page.items.len());
        for record in page.items {
            let title = self.decrypt_title(&record)?;
            let thumb = self.sign(signer, &record, &record.thumb_key, now)?;
            items.push(FeedItem {
                id: record.id,
                title,
                created_at: record.created_at,
                duration_seconds: record.duration_seconds,
                width: record.width,
                height: record.height,
                thumb_url: thumb.url,
                thumb_expires_at: thumb.expires_at,
            });
        }

        tracing::debug!(identity_id, items = items.len(), "Feed served");
        Ok(FeedResponse {
            ok: true,
            server_time: now,
            url_ttl_seconds: self.settings.url_ttl_secs,
            refresh_lead_seconds: self.settings.refresh_lead_secs,
            items,
            next_cursor: page.next_cursor,
        })
    }

    pub async fn play(&self, token: &str, asset_id: &str) -> Result<PlayResponse, PipelineError> {
        self.play_at(token, asset_id, Utc::now()).await
    }

    pub async fn play_at(
        &self,
        token: &str,
        asset_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PlayResponse, PipelineError> {
        let identity_id = self.authenticate(token, now)?;
        self.admit(identity_id, PLAY_ENDPOINT, self.settings.play_rule, now)
            .await?;

        let id = asset_id.to_string();
        let record = self
            .run_catalog(move |catalog| catalog.get_published(&id))
            .await?
            .ok_or(PipelineError::NotFound)?;

        let signer = self.signer()?;
        let title = self.decrypt_title(&record)?;
        let video = self.sign(signer, &record, &record.video_key, now)?;
        let thumb = self.sign(signer, &record, &record.thumb_key, now)?;

        tracing::debug!(identity_id, asset_id = %record.id, "Playback URL issued");
        Ok(PlayResponse {
            ok: true,
            server_time: now,
            url_ttl_seconds: self.settings.url_ttl_secs,
            refresh_lead_seconds: self.settings.refresh_lead_secs,
            id: record.id,
            title,
            duration_seconds: record.duration_seconds,
            width: record.width,
            height: record.height,
            video_url: video.url,
            video_expires_at: video.expires_at,
            thumb_url: thumb.url,
            thumb_expires_at: thumb.expires_at,
        })
    }

    fn authenticate(&self, token: &str, now: DateTime<Utc>) -> Result<i64, PipelineError> {
        self.verifier
            .verify_at(token, now)
            .map(|identity| identity.user_id)
            .map_err(|reason| {
                tracing::warn!(%reason, "Rejected identity token");
                PipelineError::Unauthenticated
            })
    }

    async fn admit(
        &self,
        identity_id: i64,
        endpoint: &'static str,
        rule: RateRule,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        match self.limiter.admit_at(identity_id, endpoint, rule, now).await {
            Ok(Admission::Allowed { .. }) => Ok(()),
            Ok(Admission::Rejected {
                retry_after_secs, ..
            }) => {
                tracing::info!(identity_id, endpoint, retry_after_secs, "Rate limited");
                Err(PipelineError::RateLimited {
                    retry_after_seconds: retry_after_secs,
                })
            }
            Err(e) => {
                tracing::error!(identity_id, endpoint, error = %e, "Rate limiter unavailable");
                Err(PipelineError::RateLimitUnavailable)
            }
        }
    }

    /// Run a catalog call off the async runtime, bounded by the store timeout.
    async fn run_catalog<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&CatalogStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let catalog = self.catalog.clone();
        let task = tokio::task::spawn_blocking(move || f(&catalog));

        let result = match tokio::time::timeout(self.settings.store_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(StoreError::Task(e.to_string())),
            Err(_) => Err(StoreError::Timeout),
        };
        result.map_err(|e| {
            tracing::error!(error = %e, "Catalog query failed");
            PipelineError::StoreUnavailable
        })
    }

    fn signer(&self) -> Result<&UrlSigner, PipelineError> {
        self.signer.as_ref().ok_or_else(|| {
            tracing::error!("Object store credentials not configured, cannot sign URLs");
            PipelineError::SigningUnavailable
        })
    }

    fn decrypt_title(&self, record: &AssetRecord) -> Result<String, PipelineError> {
        self.cipher.decrypt_wire(&record.title_enc).map_err(|e| {
            tracing::error!(asset_id = %record.id, error = %e, "Title envelope rejected");
            match e {
                EnvelopeError::InvalidEnvelope(_) => PipelineError::InvalidEnvelope,
                EnvelopeError::DecryptionFailed => PipelineError::DecryptionFailed,
            }
        })
    }

    fn sign(
        &self,
        signer: &UrlSigner,
        record: &AssetRecord,
        object_key: &str,
        now: DateTime<Utc>,
    ) -> Result<SignedUrlGrant, PipelineError> {
        signer
            .presign_get_at(&record.bucket, object_key, self.settings.url_ttl_secs, now)
            .map_err(|e| {
                tracing::error!(asset_id = %record.id, error = %e, "URL signing failed");
                PipelineError::SigningUnavailable
            })
    }
}

fn parse_limit(raw: Option<&str>) -> Result<u32, PipelineError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(DEFAULT_PAGE_SIZE);
    };
    match raw.parse::<u32>() {
        Ok(0) | Err(_) => Err(PipelineError::BadRequest(
            "limit must be a positive integer".to_string(),
        )),
        Ok(n) => Ok(n.min(MAX_PAGE_SIZE)),
    }
}

/// Both halves or neither. The timestamp is re-rendered in the stored
/// millisecond form so text comparison in the store stays ordered.
fn parse_cursor(
    created_at: Option<String>,
    id: Option<String>,
) -> Result<Option<FeedCursor>, PipelineError> {
    let created_at = created_at.filter(|v| !v.is_empty());
    let id = id.filter(|v| !v.is_empty());
    match (created_at, id) {
        (None, None) => Ok(None),
        (Some(created_at), Some(id)) => {
            let parsed = DateTime::parse_from_rfc3339(&created_at).map_err(|_| {
                PipelineError::BadRequest("cursorCreatedAt must be an RFC 3339 timestamp".to_string())
            })?;
            Ok(Some(FeedCursor {
                created_at: format_created_at(parsed.with_timezone(&Utc)),
                id,
            }))
        }
        _ => Err(PipelineError::BadRequest(
            "cursorCreatedAt and cursorId must be supplied together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::ingest::{register_asset_at, thumb_key, video_key, NewAsset};
    use crate::auth::init_data::issue_init_data;
    use crate::crypto::CipherEnvelope;
    use crate::db::init_memory_db;
    use crate::db::models::RequestLedgerEntry;
    use crate::ratelimit::LedgerError;
    use crate::presign::{AddressingStyle, SigningCredentials};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use uuid::Uuid;

    const BOT_TOKEN: &str = "7000000001:AApipelineTESTtoken";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    fn secrets() -> Secrets {
        Secrets {
            platform_secret: BOT_TOKEN.to_string(),
            metadata_key: [5u8; 32],
            tag_key: b"pipeline-tag-key".to_vec(),
        }
    }

    fn signer() -> UrlSigner {
        UrlSigner::new(SigningCredentials {
            endpoint: "https://acct.r2.cloudflarestorage.com".to_string(),
            region: "auto".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secretEXAMPLEKEY".to_string(),
            addressing_style: AddressingStyle::Path,
        })
        .unwrap()
    }

    fn token_for(user_id: i64, auth_date: DateTime<Utc>) -> String {
        let user = format!(r#"{{"id":{},"first_name":"Test"}}"#, user_id);
        let auth_date = auth_date.timestamp().to_string();
        issue_init_data(BOT_TOKEN, &[("user", &user), ("auth_date", &auth_date)])
    }

    fn fresh_token(user_id: i64) -> String {
        token_for(user_id, now() - ChronoDuration::minutes(5))
    }

    struct Harness {
        pipeline: RequestPipeline,
        db: DbPool,
    }

    fn harness_with(signer: Option<UrlSigner>) -> Harness {
        let db = init_memory_db().unwrap();
        let pipeline = RequestPipeline::new(&secrets(), PipelineSettings::default(), signer, db.clone());
        Harness { pipeline, db }
    }

    fn harness() -> Harness {
        harness_with(Some(signer()))
    }

    impl Harness {
        fn add(&self, title: &str, tags: &str, at: DateTime<Utc>) -> AssetRecord {
            let id = Uuid::new_v4();
            register_asset_at(
                &self.pipeline.catalog,
                &self.pipeline.cipher,
                &self.pipeline.index,
                NewAsset {
                    id,
                    title: title.to_string(),
                    tags: tags.to_string(),
                    duration_seconds: 30,
                    width: Some(720),
                    height: Some(1280),
                    bucket: "media".to_string(),
                    video_key: video_key("videos", &id),
                    thumb_key: thumb_key("thumbs", &id),
                },
                at,
            )
            .unwrap()
        }

        fn ledger_rows(&self) -> i64 {
            let conn = self.db.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM request_ledger", [], |r| r.get(0))
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_tag_filtered_feed_signs_thumbnails() {
        let h = harness();
        let travel = h.add("Lisbona", "travel,sunset", now() - ChronoDuration::hours(2));
        h.add("Cucina", "food", now() - ChronoDuration::hours(1));

        let response = h
            .pipeline
            .feed_at(&fresh_token(42), Some("tag=++Travel+"), now())
            .await
            .unwrap();

        assert!(response.ok);
        assert_eq!(response.url_ttl_seconds, 7200);
        assert_eq!(response.refresh_lead_seconds, 600);
        assert_eq!(response.items.len(), 1);
        let item = &response.items[0];
        assert_eq!(item.id, travel.id);
        assert_eq!(item.title, "Lisbona");
        assert_eq!(item.thumb_expires_at, now() + ChronoDuration::seconds(7200));
        assert!(item.thumb_url.contains(&travel.thumb_key));
        assert!(item.thumb_url.contains("X-Amz-Expires=7200"));

        let travel_token = h.pipeline.index.tokenize("travel").unwrap();
        assert!(h
            .pipeline
            .catalog
            .tag_tokens(&item.id)
            .unwrap()
            .contains(&travel_token));
    }

    #[tokio::test]
    async fn test_expired_token_touches_nothing() {
        let h = harness();
        h.add("Lisbona", "travel", now() - ChronoDuration::hours(1));
        let stale = token_for(42, now() - ChronoDuration::days(2));

        let err = h
            .pipeline
            .feed_at(&stale, Some("tag=travel"), now())
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::Unauthenticated);
        assert_eq!(h.ledger_rows(), 0);
    }

    #[tokio::test]
    async fn test_thirty_first_request_is_rate_limited() {
        let h = harness();
        let token = fresh_token(7);
        for i in 0..30 {
            let at = now() + ChronoDuration::seconds(i);
            h.pipeline
                .feed_at(&token, None, at)
                .await
                .unwrap();
        }
        let err = h
            .pipeline
            .feed_at(&token, None, now() + ChronoDuration::seconds(30))
            .await
            .unwrap_err();
        match err {
            PipelineError::RateLimited {
                retry_after_seconds,
            } => assert!((1..=60).contains(&retry_after_seconds)),
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_play_signs_video_and_thumbnail() {
        let h = harness();
        let record = h.add("Lisbona", "travel", now() - ChronoDuration::hours(1));

        let response = h
            .pipeline
            .play_at(&fresh_token(42), &record.id, now())
            .await
            .unwrap();
        assert_eq!(response.title, "Lisbona");
        assert!(response.video_url.contains(&record.video_key));
        assert!(response.thumb_url.contains(&record.thumb_key));
        assert_eq!(response.video_expires_at, now() + ChronoDuration::seconds(7200));
    }

    #[tokio::test]
    async fn test_play_unknown_or_unpublished_is_not_found() {
        let h = harness();
        let record = h.add("Nascosto", "travel", now() - ChronoDuration::hours(1));
        h.db.lock()
            .unwrap()
            .execute("UPDATE videos SET published = 0 WHERE id = ?1", [&record.id])
            .unwrap();

        for id in [record.id.as_str(), "does-not-exist"] {
            let err = h.pipeline.play_at(&fresh_token(42), id, now()).await.unwrap_err();
            assert_eq!(err, PipelineError::NotFound);
        }
    }

    #[tokio::test]
    async fn test_missing_signer_fails_closed() {
        let h = harness_with(None);
        let record = h.add("Lisbona", "travel", now() - ChronoDuration::hours(1));
        assert_eq!(
            h.pipeline.play_at(&fresh_token(42), &record.id, now()).await.unwrap_err(),
            PipelineError::SigningUnavailable
        );
        assert_eq!(
            h.pipeline
                .feed_at(&fresh_token(42), None, now())
                .await
                .unwrap_err(),
            PipelineError::SigningUnavailable
        );
    }

    #[tokio::test]
    async fn test_corrupt_title_aborts_whole_feed() {
        let h = harness();
        h.add("Buono", "travel", now() - ChronoDuration::hours(2));
        let bad = h.add("Rotto", "travel", now() - ChronoDuration::hours(1));
        h.db.lock()
            .unwrap()
            .execute(
                "UPDATE videos SET title_enc = 'bm90LWpzb24=' WHERE id = ?1",
                [&bad.id],
            )
            .unwrap();

        let err = h
            .pipeline
            .feed_at(&fresh_token(42), Some("tag=travel"), now())
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::InvalidEnvelope);
    }

    #[tokio::test]
    async fn test_pagination_through_pipeline() {
        let h = harness();
        for i in 0..3 {
            h.add(&format!("v{}", i), "travel", now() - ChronoDuration::minutes(10 - i));
        }
        let first = h
            .pipeline
            .feed_at(&fresh_token(42), Some("limit=2"), now())
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].title, "v2");
        let cursor = first.next_cursor.unwrap();
        let next = format!(
            "limit=2&cursorCreatedAt={}&cursorId={}",
            cursor.created_at, cursor.id
        );

        let second = h
            .pipeline
            .feed_at(&fresh_token(42), Some(next.as_str()), now())
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].title, "v0");
        assert!(second.next_cursor.is_none());
    }

    #[test]
    fn test_feed_query_parse() {
        assert_eq!(FeedQuery::parse(None).unwrap(), FeedQuery::default());
        assert_eq!(
            FeedQuery::parse(Some("tag=street+food&limit=5&initData=abc%3D1")).unwrap(),
            FeedQuery {
                tag: Some("street food".to_string()),
                limit: Some("5".to_string()),
                ..Default::default()
            }
        );
        assert!(matches!(
            FeedQuery::parse(Some("limit=1&limit=2")),
            Err(PipelineError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_query_is_checked_after_identity() {
        let h = harness();

        let err = h
            .pipeline
            .feed_at("forged=1&hash=00", Some("limit=1&limit=2"), now())
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::Unauthenticated);
        assert_eq!(h.ledger_rows(), 0);

        let err = h
            .pipeline
            .feed_at(&fresh_token(42), Some("limit=1&limit=2"), now())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BadRequest(_)));
        // Admission ran before the query was looked at
        assert_eq!(h.ledger_rows(), 1);
    }

    #[tokio::test]
    async fn test_tampered_title_fails_decryption() {
        let h = harness();
        let record = h.add("Lisbona", "travel", now() - ChronoDuration::hours(1));
        let mut envelope = CipherEnvelope::from_wire(&record.title_enc).unwrap();
        envelope.ciphertext[0] ^= 0x01;
        h.db.lock()
            .unwrap()
            .execute(
                "UPDATE videos SET title_enc = ?1 WHERE id = ?2",
                [envelope.to_wire(), record.id.clone()],
            )
            .unwrap();

        assert_eq!(
            h.pipeline.play_at(&fresh_token(42), &record.id, now()).await.unwrap_err(),
            PipelineError::DecryptionFailed
        );
        assert_eq!(
            h.pipeline
                .feed_at(&fresh_token(42), Some("tag=travel"), now())
                .await
                .unwrap_err(),
            PipelineError::DecryptionFailed
        );
    }

    #[tokio::test]
    async fn test_ledger_storage_failure_fails_closed() {
        let h = harness();
        let record = h.add("Lisbona", "travel", now() - ChronoDuration::hours(1));
        h.db.lock()
            .unwrap()
            .execute_batch("DROP TABLE request_ledger;")
            .unwrap();

        assert_eq!(
            h.pipeline.play_at(&fresh_token(42), &record.id, now()).await.unwrap_err(),
            PipelineError::RateLimitUnavailable
        );
        assert_eq!(
            h.pipeline
                .feed_at(&fresh_token(42), None, now())
                .await
                .unwrap_err(),
            PipelineError::RateLimitUnavailable
        );
    }

    /// Ledger whose append never finishes within a short store timeout.
    struct StalledLedger;

    impl RequestLedger for StalledLedger {
        fn append(&self, _entry: &RequestLedgerEntry) -> Result<(), LedgerError> {
            std::thread::sleep(std::time::Duration::from_millis(300));
            Ok(())
        }

        fn count_since(&self, _identity_id: i64, _since_ms: i64) -> Result<u64, LedgerError> {
            Ok(0)
        }

        fn nth_oldest_since(
            &self,
            _identity_id: i64,
            _since_ms: i64,
            _offset: u64,
        ) -> Result<Option<i64>, LedgerError> {
            Ok(None)
        }
    }

    fn short_timeout() -> PipelineSettings {
        PipelineSettings {
            store_timeout: Duration::from_millis(10),
            ..PipelineSettings::default()
        }
    }

    #[tokio::test]
    async fn test_ledger_timeout_fails_closed() {
        let db = init_memory_db().unwrap();
        let pipeline = RequestPipeline::with_ledger(
            &secrets(),
            short_timeout(),
            Some(signer()),
            db,
            Arc::new(StalledLedger),
        );
        assert_eq!(
            pipeline
                .feed_at(&fresh_token(42), None, now())
                .await
                .unwrap_err(),
            PipelineError::RateLimitUnavailable
        );
    }

    #[tokio::test]
    async fn test_catalog_storage_failure_fails_closed() {
        let h = harness();
        h.db.lock()
            .unwrap()
            .execute_batch("DROP TABLE video_tag_tokens; DROP TABLE videos;")
            .unwrap();

        assert_eq!(
            h.pipeline
                .feed_at(&fresh_token(42), None, now())
                .await
                .unwrap_err(),
            PipelineError::StoreUnavailable
        );
        assert_eq!(
            h.pipeline.play_at(&fresh_token(42), "any-id", now()).await.unwrap_err(),
            PipelineError::StoreUnavailable
        );
    }

    #[tokio::test]
    async fn test_catalog_timeout_fails_closed() {
        let catalog_db = init_memory_db().unwrap();
        let ledger = Arc::new(SqliteLedger::new(init_memory_db().unwrap()));
        let pipeline = RequestPipeline::with_ledger(
            &secrets(),
            short_timeout(),
            Some(signer()),
            catalog_db.clone(),
            ledger,
        );

        // Hold the catalog connection so the query cannot start in time
        let guard = catalog_db.lock().unwrap();
        let err = pipeline
            .feed_at(&fresh_token(42), None, now())
            .await
            .unwrap_err();
        drop(guard);
        assert_eq!(err, PipelineError::StoreUnavailable);
    }

    #[test]
    fn test_settings_reject_out_of_range_values() {
        assert!(PipelineSettings::from_config(&Config::default()).is_ok());

        let mut config = Config::default();
        config.delivery.url_ttl_secs = MAX_EXPIRES_SECS + 1;
        assert!(matches!(
            PipelineSettings::from_config(&config),
            Err(ConfigError::OutOfRange {
                name: "delivery.url_ttl_secs",
                ..
            })
        ));

        let mut config = Config::default();
        config.limits.window_secs = u64::MAX;
        assert!(matches!(
            PipelineSettings::from_config(&config),
            Err(ConfigError::OutOfRange {
                name: "limits.window_secs",
                ..
            })
        ));

        let mut config = Config::default();
        config.delivery.refresh_lead_secs = config.delivery.url_ttl_secs;
        assert!(PipelineSettings::from_config(&config).is_err());

        let mut config = Config::default();
        config.limits.play_per_window = 0;
        assert!(PipelineSettings::from_config(&config).is_err());
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None).unwrap(), DEFAULT_PAGE_SIZE);
        assert_eq!(parse_limit(Some("")).unwrap(), DEFAULT_PAGE_SIZE);
        assert_eq!(parse_limit(Some("7")).unwrap(), 7);
        assert_eq!(parse_limit(Some("500")).unwrap(), MAX_PAGE_SIZE);
        assert!(parse_limit(Some("0")).is_err());
        assert!(parse_limit(Some("-1")).is_err());
        assert!(parse_limit(Some("ten")).is_err());
    }

    #[test]
    fn test_parse_cursor() {
        assert_eq!(parse_cursor(None, None).unwrap(), None);
        assert!(matches!(
            parse_cursor(Some("2026-10-16T12:00:00Z".into()), None),
            Err(PipelineError::BadRequest(_))
        ));
        assert!(matches!(
            parse_cursor(None, Some("abc".into())),
            Err(PipelineError::BadRequest(_))
        ));
        assert!(matches!(
            parse_cursor(Some("yesterday".into()), Some("abc".into())),
            Err(PipelineError::BadRequest(_))
        ));
        assert_eq!(
            parse_cursor(Some("2026-10-16T14:00:00+02:00".into()), Some("abc".into())).unwrap(),
            Some(FeedCursor {
                created_at: "2026-10-16T12:00:00.000Z".to_string(),
                id: "abc".to_string(),
            })
        );
    }
}
