/// Database row types.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.

/// One catalog item in the videos table. The title stays an encrypted
/// envelope until the serving pipeline decrypts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub id: String,
    /// RFC 3339, millisecond precision, UTC (`2026-10-16T12:00:00.000Z`)
    pub created_at: String,
    pub title_enc: String,
    pub duration_seconds: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub bucket: String,
    pub video_key: String,
    pub thumb_key: String,
    pub published: bool,
}

/// One appended row of the request ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLedgerEntry {
    pub identity_id: i64,
    pub endpoint: String,
    /// Unix epoch milliseconds
    pub ts_ms: i64,
}
