use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking, no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Catalog

CREATE TABLE videos (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    title_enc TEXT NOT NULL,
    duration_seconds INTEGER NOT NULL,
    width INTEGER,
    height INTEGER,
    r2_bucket TEXT NOT NULL,
    r2_video_key TEXT NOT NULL,
    r2_thumb_key TEXT NOT NULL,
    published INTEGER NOT NULL DEFAULT 1,
    CHECK (r2_video_key <> r2_thumb_key)
);

-- Keyset pagination walks (created_at, id) descending
CREATE INDEX idx_videos_feed ON videos(published, created_at DESC, id DESC);

CREATE TABLE video_tag_tokens (
    video_id TEXT NOT NULL,
    tag_hmac TEXT NOT NULL CHECK (length(tag_hmac) = 64),
    PRIMARY KEY (video_id, tag_hmac),
    FOREIGN KEY (video_id) REFERENCES videos(id) ON DELETE CASCADE
);

CREATE INDEX idx_video_tag_tokens_hmac ON video_tag_tokens(tag_hmac);
",
        ),
        M::up(
            "-- Migration 2: Request ledger (append-only, sliding-window rate limiting)

CREATE TABLE request_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL,
    endpoint TEXT NOT NULL,
    ts_ms INTEGER NOT NULL
);

CREATE INDEX idx_request_ledger_identity_ts ON request_ledger(identity_id, ts_ms);
",
        ),
    ])
}
