//! Registration of already-uploaded objects into the catalog.
//!
//! Transcoding and upload happen elsewhere; this step encrypts the title,
//! blind-indexes the tags and writes the rows.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::assets::store::{format_created_at, CatalogStore, StoreError};
use crate::crypto::{BlindIndex, BlindIndexError, MetadataCipher};
use crate::db::models::AssetRecord;

pub const DEFAULT_VIDEO_PREFIX: &str = "videos";
pub const DEFAULT_THUMB_PREFIX: &str = "thumbs";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("duration must be non-negative")]
    InvalidDuration,
    #[error("video and thumbnail keys must differ")]
    SameObjectKey,
    #[error(transparent)]
    Tags(#[from] BlindIndexError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Plaintext description of an asset about to be registered.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub id: Uuid,
    pub title: String,
    /// Comma-separated; each tag becomes its own token
    pub tags: String,
    pub duration_seconds: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub bucket: String,
    pub video_key: String,
    pub thumb_key: String,
}

/// `{prefix}/{id}.mp4`
pub fn video_key(prefix: &str, id: &Uuid) -> String {
    format!("{}/{}.mp4", prefix.trim_end_matches('/'), id)
}

/// `{prefix}/{id}.jpg`
pub fn thumb_key(prefix: &str, id: &Uuid) -> String {
    format!("{}/{}.jpg", prefix.trim_end_matches('/'), id)
}

pub fn register_asset(
    store: &CatalogStore,
    cipher: &MetadataCipher,
    index: &BlindIndex,
    asset: NewAsset,
) -> Result<AssetRecord, IngestError> {
    register_asset_at(store, cipher, index, asset, Utc::now())
}

pub fn register_asset_at(
    store: &CatalogStore,
    cipher: &MetadataCipher,
    index: &BlindIndex,
    asset: NewAsset,
    now: DateTime<Utc>,
) -> Result<AssetRecord, IngestError> {
    if asset.title.trim().is_empty() {
        return Err(IngestError::EmptyTitle);
    }
    if asset.duration_seconds < 0 {
        return Err(IngestError::InvalidDuration);
    }
    if asset.video_key == asset.thumb_key {
        return Err(IngestError::SameObjectKey);
    }

    let tag_tokens = index.tokenize_list(&asset.tags)?;

    let record = AssetRecord {
        id: asset.id.to_string(),
        created_at: format_created_at(now),
        title_enc: cipher.encrypt_to_wire(&asset.title),
        duration_seconds: asset.duration_seconds,
        width: asset.width,
        height: asset.height,
        bucket: asset.bucket,
        video_key: asset.video_key,
        thumb_key: asset.thumb_key,
        published: true,
    };
    store.insert_asset(&record, &tag_tokens)?;

    tracing::info!(
        asset_id = %record.id,
        tag_count = tag_tokens.len(),
        "Registered asset"
    );
    Ok(record)
}
