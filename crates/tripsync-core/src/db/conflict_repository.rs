//! Conflict history repository implementation

use crate::error::{Error, Result};
use crate::models::{ConflictResolution, EntityId, EntityKind, SyncConflict};
use rusqlite::{params, Connection};

const COLUMNS: &str =
    "id, entity_type, entity_id, local_version, server_version, detected_at, resolved_at, resolution";

/// Trait for the conflict log
pub trait ConflictRepository {
    /// Record a newly detected conflict; returns its row id
    fn log(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
        local_version: i64,
        server_version: i64,
        detected_at: i64,
    ) -> Result<i64>;

    /// Close every open conflict for an entity; returns the number closed
    fn resolve(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
        resolution: ConflictResolution,
        resolved_at: i64,
    ) -> Result<usize>;

    /// Most recent conflicts first
    fn list_recent(&self, limit: usize) -> Result<Vec<SyncConflict>>;

    fn open_count(&self) -> Result<usize>;

    fn clear(&self) -> Result<usize>;
}

/// `SQLite` implementation of `ConflictRepository`
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

struct RawConflictRow {
    id: i64,
    entity_type: String,
    entity_id: String,
    local_version: i64,
    server_version: i64,
    detected_at: i64,
    resolved_at: Option<i64>,
    resolution: Option<String>,
}

impl RawConflictRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            local_version: row.get(3)?,
            server_version: row.get(4)?,
            detected_at: row.get(5)?,
            resolved_at: row.get(6)?,
            resolution: row.get(7)?,
        })
    }

    fn into_conflict(self) -> Result<SyncConflict> {
        Ok(SyncConflict {
            id: self.id,
            entity_kind: self.entity_type.parse()?,
            entity_id: self.entity_id.parse().map_err(|_| {
                Error::InvalidInput(format!("Invalid entity ID '{}'", self.entity_id))
            })?,
            local_version: self.local_version,
            server_version: self.server_version,
            detected_at: self.detected_at,
            resolved_at: self.resolved_at,
            resolution: self.resolution.as_deref().map(str::parse).transpose()?,
        })
    }
}

impl<'a> SqliteConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl ConflictRepository for SqliteConflictRepository<'_> {
    fn log(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
        local_version: i64,
        server_version: i64,
        detected_at: i64,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_conflicts (entity_type, entity_id, local_version, server_version, detected_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                kind.as_str(),
                entity_id.as_str(),
                local_version,
                server_version,
                detected_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn resolve(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
        resolution: ConflictResolution,
        resolved_at: i64,
    ) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE sync_conflicts SET resolved_at = ?, resolution = ?
             WHERE entity_type = ? AND entity_id = ? AND resolved_at IS NULL",
            params![
                resolved_at,
                resolution.as_str(),
                kind.as_str(),
                entity_id.as_str(),
            ],
        )?;
        Ok(rows)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM sync_conflicts ORDER BY detected_at DESC, id DESC LIMIT ?"
        ))?;
        let rows = stmt
            .query_map(
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
                RawConflictRow::read,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawConflictRow::into_conflict).collect()
    }

    fn open_count(&self) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE resolved_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn clear(&self) -> Result<usize> {
        let rows = self.conn.execute("DELETE FROM sync_conflicts", [])?;
        Ok(rows)
    }
}
