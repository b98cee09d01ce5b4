//! Sync metadata repository implementation

use crate::error::Result;
use crate::models::{EntityKind, SyncMetadata};
use rusqlite::{params, Connection, OptionalExtension};

const COLUMNS: &str = "entity_type, last_sync_timestamp, last_full_sync_timestamp, \
                       sync_in_progress, total_synced, last_sync_error";

/// Trait for per-kind sync bookkeeping
pub trait MetadataRepository {
    /// Create the row for a kind if missing; existing rows are untouched
    fn initialize_if_not_exists(&self, kind: EntityKind) -> Result<()>;

    fn get(&self, kind: EntityKind) -> Result<Option<SyncMetadata>>;

    fn list(&self) -> Result<Vec<SyncMetadata>>;

    /// Set the in-progress flag if it is clear; returns whether it was set
    fn mark_in_progress(&self, kind: EntityKind) -> Result<bool>;

    /// Advance the watermark (if any), add to the counter, clear flag and error
    fn record_success(
        &self,
        kind: EntityKind,
        watermark: Option<i64>,
        full_sync: bool,
        synced: i64,
    ) -> Result<()>;

    /// Record the error and clear the flag; the watermark stays put
    fn record_failure(&self, kind: EntityKind, error: &str) -> Result<()>;

    fn clear_in_progress(&self, kind: EntityKind) -> Result<()>;

    /// Clear flags left behind by an interrupted process; returns the count
    fn reset_stale_in_progress(&self) -> Result<usize>;

    /// Forget all watermarks and counters
    fn clear(&self) -> Result<usize>;
}

/// `SQLite` implementation of `MetadataRepository`
pub struct SqliteMetadataRepository<'a> {
    conn: &'a Connection,
}

struct RawMetadataRow {
    entity_type: String,
    last_sync_timestamp: Option<i64>,
    last_full_sync_timestamp: Option<i64>,
    sync_in_progress: bool,
    total_synced: i64,
    last_sync_error: Option<String>,
}

impl RawMetadataRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_type: row.get(0)?,
            last_sync_timestamp: row.get(1)?,
            last_full_sync_timestamp: row.get(2)?,
            sync_in_progress: row.get(3)?,
            total_synced: row.get(4)?,
            last_sync_error: row.get(5)?,
        })
    }

    fn into_metadata(self) -> Result<SyncMetadata> {
        Ok(SyncMetadata {
            entity_kind: self.entity_type.parse()?,
            last_sync_timestamp: self.last_sync_timestamp,
            last_full_sync_timestamp: self.last_full_sync_timestamp,
            sync_in_progress: self.sync_in_progress,
            total_synced: self.total_synced,
            last_sync_error: self.last_sync_error,
        })
    }
}

impl<'a> SqliteMetadataRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl MetadataRepository for SqliteMetadataRepository<'_> {
    fn initialize_if_not_exists(&self, kind: EntityKind) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO sync_metadata (entity_type) VALUES (?)",
            params![kind.as_str()],
        )?;
        Ok(())
    }

    fn get(&self, kind: EntityKind) -> Result<Option<SyncMetadata>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM sync_metadata WHERE entity_type = ?"),
                params![kind.as_str()],
                RawMetadataRow::read,
            )
            .optional()?;

        raw.map(RawMetadataRow::into_metadata).transpose()
    }

    fn list(&self) -> Result<Vec<SyncMetadata>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_metadata ORDER BY entity_type"
        ))?;
        let rows = stmt
            .query_map([], RawMetadataRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawMetadataRow::into_metadata).collect()
    }

    fn mark_in_progress(&self, kind: EntityKind) -> Result<bool> {
        self.initialize_if_not_exists(kind)?;
        let rows = self.conn.execute(
            "UPDATE sync_metadata SET sync_in_progress = 1
             WHERE entity_type = ? AND sync_in_progress = 0",
            params![kind.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn record_success(
        &self,
        kind: EntityKind,
        watermark: Option<i64>,
        full_sync: bool,
        synced: i64,
    ) -> Result<()> {
        self.initialize_if_not_exists(kind)?;
        self.conn.execute(
            "UPDATE sync_metadata SET
                last_sync_timestamp = CASE WHEN ?1 IS NULL THEN last_sync_timestamp
                    ELSE MAX(COALESCE(last_sync_timestamp, ?1), ?1) END,
                last_full_sync_timestamp = CASE WHEN ?2 AND ?1 IS NOT NULL
                    THEN ?1 ELSE last_full_sync_timestamp END,
                total_synced = total_synced + ?3,
                sync_in_progress = 0,
                last_sync_error = NULL
             WHERE entity_type = ?4",
            params![watermark, full_sync, synced, kind.as_str()],
        )?;
        Ok(())
    }

    fn record_failure(&self, kind: EntityKind, error: &str) -> Result<()> {
        self.initialize_if_not_exists(kind)?;
        self.conn.execute(
            "UPDATE sync_metadata SET sync_in_progress = 0, last_sync_error = ?
             WHERE entity_type = ?",
            params![error, kind.as_str()],
        )?;
        Ok(())
    }

    fn clear_in_progress(&self, kind: EntityKind) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_metadata SET sync_in_progress = 0 WHERE entity_type = ?",
            params![kind.as_str()],
        )?;
        Ok(())
    }

    fn reset_stale_in_progress(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE sync_metadata SET sync_in_progress = 0 WHERE sync_in_progress = 1",
            [],
        )?;
        Ok(rows)
    }

    fn clear(&self) -> Result<usize> {
        let rows = self.conn.execute("DELETE FROM sync_metadata", [])?;
        Ok(rows)
    }
}
