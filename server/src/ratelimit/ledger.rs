//! Append-only request ledger backing the sliding-window limiter.

use rusqlite::OptionalExtension;

use crate::db::models::RequestLedgerEntry;
use crate::db::DbPool;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger lock poisoned")]
    Lock,
    #[error("ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("ledger call timed out")]
    Timeout,
    #[error("ledger task failed: {0}")]
    Task(String),
}

/// Storage interface for the ledger. Implementations must give
/// read-after-write consistency for one identity's rows.
pub trait RequestLedger: Send + Sync {
    fn append(&self, entry: &RequestLedgerEntry) -> Result<(), LedgerError>;

    /// Number of entries for `identity_id` with `ts_ms >= since_ms`.
    fn count_since(&self, identity_id: i64, since_ms: i64) -> Result<u64, LedgerError>;

    /// Timestamp of the entry at `offset` (0 = oldest) among those with
    /// `ts_ms >= since_ms`, oldest first.
    fn nth_oldest_since(
        &self,
        identity_id: i64,
        since_ms: i64,
        offset: u64,
    ) -> Result<Option<i64>, LedgerError>;
}

/// Ledger stored in the `request_ledger` table.
#[derive(Clone)]
pub struct SqliteLedger {
    db: DbPool,
}

impl SqliteLedger {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

impl RequestLedger for SqliteLedger {
    fn append(&self, entry: &RequestLedgerEntry) -> Result<(), LedgerError> {
        let conn = self.db.lock().map_err(|_| LedgerError::Lock)?;
        conn.execute(
            "INSERT INTO request_ledger (identity_id, endpoint, ts_ms) VALUES (?1, ?2, ?3)",
            rusqlite::params![entry.identity_id, entry.endpoint, entry.ts_ms],
        )?;
        Ok(())
    }

    fn count_since(&self, identity_id: i64, since_ms: i64) -> Result<u64, LedgerError> {
        let conn = self.db.lock().map_err(|_| LedgerError::Lock)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM request_ledger WHERE identity_id = ?1 AND ts_ms >= ?2",
            rusqlite::params![identity_id, since_ms],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn nth_oldest_since(
        &self,
        identity_id: i64,
        since_ms: i64,
        offset: u64,
    ) -> Result<Option<i64>, LedgerError> {
        let conn = self.db.lock().map_err(|_| LedgerError::Lock)?;
        let ts = conn
            .query_row(
                "SELECT ts_ms FROM request_ledger
                 WHERE identity_id = ?1 AND ts_ms >= ?2
                 ORDER BY ts_ms ASC, id ASC
                 LIMIT 1 OFFSET ?3",
                rusqlite::params![identity_id, since_ms, offset as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts)
    }
}
