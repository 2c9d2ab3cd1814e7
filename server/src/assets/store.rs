//! Catalog queries over the `videos` and `video_tag_tokens` tables.
//!
//! The store never sees plaintext: titles arrive as envelopes and tags as
//! blind-index tokens. Reads only return published rows.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::crypto::blind_index::{is_valid_token, TOKEN_HEX_LEN};
use crate::db::models::AssetRecord;
use crate::db::DbPool;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("catalog lock poisoned")]
    Lock,
    #[error("catalog storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("catalog call timed out")]
    Timeout,
    #[error("catalog task failed: {0}")]
    Task(String),
    #[error("tag token is not a {0}-char lowercase hex digest")]
    InvalidTagToken(usize),
}

/// Position after the last row of a page. Both halves are required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedCursor {
    pub created_at: String,
    pub id: String,
}

/// Creation timestamps are stored at millisecond precision so keyset
/// pagination can compare them as text.
pub fn format_created_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub items: Vec<AssetRecord>,
    pub next_cursor: Option<FeedCursor>,
}

const ASSET_COLUMNS: &str = "id, created_at, title_enc, duration_seconds, width, height, \
     r2_bucket, r2_video_key, r2_thumb_key, published";

fn row_to_asset(row: &Row<'_>) -> rusqlite::Result<AssetRecord> {
    Ok(AssetRecord {
        id: row.get(0)?,
        created_at: row.get(1)?,
        title_enc: row.get(2)?,
        duration_seconds: row.get(3)?,
        width: row.get(4)?,
        height: row.get(5)?,
        bucket: row.get(6)?,
        video_key: row.get(7)?,
        thumb_key: row.get(8)?,
        published: row.get::<_, i64>(9)? != 0,
    })
}

#[derive(Clone)]
pub struct CatalogStore {
    db: DbPool,
}

impl CatalogStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// One page of published assets, newest first, optionally restricted to
    /// assets carrying `tag_token`. Walks `(created_at, id)` descending.
    pub fn list_published(
        &self,
        tag_token: Option<&str>,
        cursor: Option<&FeedCursor>,
        limit: u32,
    ) -> Result<FeedPage, StoreError> {
        if let Some(token) = tag_token {
            if !is_valid_token(token) {
                return Err(StoreError::InvalidTagToken(TOKEN_HEX_LEN));
            }
        }

        let conn = self.db.lock().map_err(|_| StoreError::Lock)?;
        let sql = format!(
            "SELECT {} FROM videos v
             WHERE v.published = 1
               AND (?1 IS NULL OR EXISTS (
                    SELECT 1 FROM video_tag_tokens t
                    WHERE t.video_id = v.id AND t.tag_hmac = ?1))
               AND (?2 IS NULL OR (v.created_at, v.id) < (?2, ?3))
             ORDER BY v.created_at DESC, v.id DESC
             LIMIT ?4",
            ASSET_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;

        // One extra row tells us whether another page exists
        let fetch = limit as i64 + 1;
        let mut items = stmt
            .query_map(
                params![
                    tag_token,
                    cursor.map(|c| c.created_at.as_str()),
                    cursor.map(|c| c.id.as_str()),
                    fetch
                ],
                row_to_asset,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = if items.len() > limit as usize {
            items.truncate(limit as usize);
            items.last().map(|last| FeedCursor {
                created_at: last.created_at.clone(),
                id: last.id.clone(),
            })
        } else {
            None
        };

        Ok(FeedPage { items, next_cursor })
    }

    /// A published asset by id. Unpublished rows look exactly like missing ones.
    pub fn get_published(&self, id: &str) -> Result<Option<AssetRecord>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::Lock)?;
        let sql = format!(
            "SELECT {} FROM videos WHERE id = ?1 AND published = 1",
            ASSET_COLUMNS
        );
        Ok(conn.query_row(&sql, params![id], row_to_asset).optional()?)
    }

    /// Insert an asset and its tag tokens atomically.
    pub fn insert_asset(&self, asset: &AssetRecord, tag_tokens: &[String]) -> Result<(), StoreError> {
        if let Some(bad) = tag_tokens.iter().find(|t| !is_valid_token(t)) {
            tracing::warn!(token_len = bad.len(), "Refusing malformed tag token");
            return Err(StoreError::InvalidTagToken(TOKEN_HEX_LEN));
        }

        let mut conn = self.db.lock().map_err(|_| StoreError::Lock)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO videos (id, created_at, title_enc, duration_seconds, width, height,
                                 r2_bucket, r2_video_key, r2_thumb_key, published)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                asset.id,
                asset.created_at,
                asset.title_enc,
                asset.duration_seconds,
                asset.width,
                asset.height,
                asset.bucket,
                asset.video_key,
                asset.thumb_key,
                asset.published as i64,
            ],
        )?;
        for token in tag_tokens {
            tx.execute(
                "INSERT OR IGNORE INTO video_tag_tokens (video_id, tag_hmac) VALUES (?1, ?2)",
                params![asset.id, token],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Blind-index tokens attached to an asset, sorted.
    pub fn tag_tokens(&self, asset_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.db.lock().map_err(|_| StoreError::Lock)?;
        let mut stmt = conn.prepare(
            "SELECT tag_hmac FROM video_tag_tokens WHERE video_id = ?1 ORDER BY tag_hmac",
        )?;
        let tokens = stmt
            .query_map(params![asset_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tokens)
    }
}
