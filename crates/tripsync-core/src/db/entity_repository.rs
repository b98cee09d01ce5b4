//! Entity repository implementation
//!
//! Every entity kind lives in its own table with identical sync columns, so a
//! single repository serves all of them, keyed by [`EntityKind`].

use crate::error::{Error, Result};
use crate::models::{
    ConflictSnapshot, EntityId, EntityKind, EntityPayload, SyncMeta, SyncStatus,
};
use rusqlite::{params, Connection, OptionalExtension};

const COLUMNS: &str = "id, user_id, data, sync_status, local_updated_at, server_updated_at, \
                       version, server_version, deleted_at, conflict_data";

/// An entity row as persisted, with its kind-tagged payload
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub kind: EntityKind,
    pub id: EntityId,
    pub user_id: String,
    pub data: EntityPayload,
    pub sync: SyncMeta,
    /// Server snapshot parked while the row is in `CONFLICT`
    pub conflict: Option<ConflictSnapshot>,
}

/// Trait for entity storage operations
pub trait EntityRepository {
    /// Insert a new row; fails if the id already exists
    fn insert(&self, entity: &StoredEntity) -> Result<()>;

    /// Get a row by id, soft-deleted rows included
    fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<StoredEntity>>;

    /// List live rows, most recently edited first
    fn list(&self, kind: EntityKind, user_id: Option<&str>) -> Result<Vec<StoredEntity>>;

    /// List rows in the given sync status
    fn list_by_status(&self, kind: EntityKind, status: SyncStatus) -> Result<Vec<StoredEntity>>;

    /// List rows whose status is not `SYNCED`
    fn list_needing_sync(&self, kind: EntityKind) -> Result<Vec<StoredEntity>>;

    /// Replace domain fields, bump the version and flag for upload
    fn update_data(
        &self,
        kind: EntityKind,
        id: &EntityId,
        data: &EntityPayload,
        now: i64,
    ) -> Result<SyncMeta>;

    /// Bump the version and flag for upload; returns the new version
    fn mark_needing_sync(&self, kind: EntityKind, id: &EntityId, now: i64) -> Result<i64>;

    /// Record a server acknowledgement of `pushed_version`.
    ///
    /// The row only becomes `SYNCED` if no local edit happened since; returns
    /// whether it did.
    fn mark_synced(
        &self,
        kind: EntityKind,
        id: &EntityId,
        pushed_version: i64,
        server_updated_at: i64,
    ) -> Result<bool>;

    /// Move the row to `CONFLICT`, parking the server snapshot
    fn mark_conflict(
        &self,
        kind: EntityKind,
        id: &EntityId,
        snapshot: &ConflictSnapshot,
    ) -> Result<()>;

    /// Leave `CONFLICT` keeping local fields, rebased on the server version
    fn requeue_local(
        &self,
        kind: EntityKind,
        id: &EntityId,
        version: i64,
        server_version: i64,
        server_updated_at: i64,
        now: i64,
    ) -> Result<()>;

    /// Insert or overwrite a row with server state, status `SYNCED`
    fn upsert_synced(&self, entity: &StoredEntity) -> Result<()>;

    /// Apply a server deletion to an existing row; returns false if absent
    fn apply_tombstone(
        &self,
        kind: EntityKind,
        id: &EntityId,
        version: i64,
        server_updated_at: i64,
        deleted_at: i64,
    ) -> Result<bool>;

    /// Physically remove a row; returns whether it existed
    fn remove(&self, kind: EntityKind, id: &EntityId) -> Result<bool>;

    /// Count rows in the given status
    fn count_by_status(&self, kind: EntityKind, status: SyncStatus) -> Result<usize>;

    /// Remove every row of a kind; returns the number removed
    fn clear(&self, kind: EntityKind) -> Result<usize>;
}

/// `SQLite` implementation of `EntityRepository`
pub struct SqliteEntityRepository<'a> {
    conn: &'a Connection,
}

/// Raw column values, converted outside the rusqlite row callback
struct RawEntityRow {
    id: String,
    user_id: String,
    data: String,
    sync_status: String,
    local_updated_at: i64,
    server_updated_at: Option<i64>,
    version: i64,
    server_version: Option<i64>,
    deleted_at: Option<i64>,
    conflict_data: Option<String>,
}

impl RawEntityRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            data: row.get(2)?,
            sync_status: row.get(3)?,
            local_updated_at: row.get(4)?,
            server_updated_at: row.get(5)?,
            version: row.get(6)?,
            server_version: row.get(7)?,
            deleted_at: row.get(8)?,
            conflict_data: row.get(9)?,
        })
    }

    fn into_entity(self, kind: EntityKind) -> Result<StoredEntity> {
        let id = self
            .id
            .parse()
            .map_err(|_| Error::InvalidInput(format!("Invalid entity ID '{}'", self.id)))?;
        let conflict = self
            .conflict_data
            .as_deref()
            .map(serde_json::from_str::<ConflictSnapshot>)
            .transpose()?;

        Ok(StoredEntity {
            kind,
            id,
            user_id: self.user_id,
            data: EntityPayload::from_data_json(kind, &self.data)?,
            sync: SyncMeta {
                sync_status: self.sync_status.parse()?,
                local_updated_at: self.local_updated_at,
                server_updated_at: self.server_updated_at,
                version: self.version,
                server_version: self.server_version,
                deleted_at: self.deleted_at,
            },
            conflict,
        })
    }
}

impl<'a> SqliteEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn query_entities(
        &self,
        kind: EntityKind,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StoredEntity>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawEntityRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(|raw| raw.into_entity(kind)).collect()
    }

    fn current_status(&self, kind: EntityKind, id: &EntityId) -> Result<Option<SyncStatus>> {
        let status: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT sync_status FROM {} WHERE id = ?", kind.table()),
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        status.map(|status| status.parse()).transpose()
    }

    /// Fail unless the row exists and is not frozen in `CONFLICT`
    fn ensure_editable(&self, kind: EntityKind, id: &EntityId) -> Result<()> {
        match self.current_status(kind, id)? {
            None => Err(Error::NotFound(format!("{kind} {id}"))),
            Some(SyncStatus::Conflict) => Err(Error::InvalidState(format!(
                "{kind} {id} is in conflict and must be resolved first"
            ))),
            Some(_) => Ok(()),
        }
    }
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn insert(&self, entity: &StoredEntity) -> Result<()> {
        let conflict = entity
            .conflict
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn.execute(
            &format!(
                "INSERT INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                entity.kind.table()
            ),
            params![
                entity.id.as_str(),
                entity.user_id,
                entity.data.to_data_json()?,
                entity.sync.sync_status.as_str(),
                entity.sync.local_updated_at,
                entity.sync.server_updated_at,
                entity.sync.version,
                entity.sync.server_version,
                entity.sync.deleted_at,
                conflict,
            ],
        )?;
        Ok(())
    }

    fn get(&self, kind: EntityKind, id: &EntityId) -> Result<Option<StoredEntity>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM {} WHERE id = ?", kind.table()),
                params![id.as_str()],
                RawEntityRow::read,
            )
            .optional()?;

        raw.map(|raw| raw.into_entity(kind)).transpose()
    }

    fn list(&self, kind: EntityKind, user_id: Option<&str>) -> Result<Vec<StoredEntity>> {
        let table = kind.table();
        match user_id {
            Some(user_id) => self.query_entities(
                kind,
                &format!(
                    "SELECT {COLUMNS} FROM {table}
                     WHERE deleted_at IS NULL AND user_id = ?
                     ORDER BY local_updated_at DESC"
                ),
                params![user_id],
            ),
            None => self.query_entities(
                kind,
                &format!(
                    "SELECT {COLUMNS} FROM {table}
                     WHERE deleted_at IS NULL
                     ORDER BY local_updated_at DESC"
                ),
                [],
            ),
        }
    }

    fn list_by_status(&self, kind: EntityKind, status: SyncStatus) -> Result<Vec<StoredEntity>> {
        self.query_entities(
            kind,
            &format!(
                "SELECT {COLUMNS} FROM {} WHERE sync_status = ? ORDER BY local_updated_at ASC",
                kind.table()
            ),
            params![status.as_str()],
        )
    }

    fn list_needing_sync(&self, kind: EntityKind) -> Result<Vec<StoredEntity>> {
        self.query_entities(
            kind,
            &format!(
                "SELECT {COLUMNS} FROM {} WHERE sync_status != 'SYNCED' ORDER BY local_updated_at ASC",
                kind.table()
            ),
            [],
        )
    }

    fn update_data(
        &self,
        kind: EntityKind,
        id: &EntityId,
        data: &EntityPayload,
        now: i64,
    ) -> Result<SyncMeta> {
        if data.kind() != kind {
            return Err(Error::InvalidInput(format!(
                "Cannot store {} data in {kind} table",
                data.kind()
            )));
        }
        self.ensure_editable(kind, id)?;

        self.conn.execute(
            &format!(
                "UPDATE {} SET data = ?, version = version + 1, sync_status = 'PENDING_UPLOAD',
                 local_updated_at = ? WHERE id = ? AND sync_status != 'CONFLICT'",
                kind.table()
            ),
            params![data.to_data_json()?, now, id.as_str()],
        )?;

        self.get(kind, id)?
            .map(|entity| entity.sync)
            .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
    }

    fn mark_needing_sync(&self, kind: EntityKind, id: &EntityId, now: i64) -> Result<i64> {
        self.ensure_editable(kind, id)?;

        let version = self.conn.query_row(
            &format!(
                "UPDATE {} SET version = version + 1, sync_status = 'PENDING_UPLOAD',
                 local_updated_at = ? WHERE id = ? AND sync_status != 'CONFLICT'
                 RETURNING version",
                kind.table()
            ),
            params![now, id.as_str()],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn mark_synced(
        &self,
        kind: EntityKind,
        id: &EntityId,
        pushed_version: i64,
        server_updated_at: i64,
    ) -> Result<bool> {
        let synced: Option<bool> = self
            .conn
            .query_row(
                &format!(
                    "UPDATE {} SET
                        sync_status = CASE WHEN version = ?1 THEN 'SYNCED' ELSE sync_status END,
                        server_version = ?1,
                        server_updated_at = ?2
                     WHERE id = ?3 AND sync_status != 'CONFLICT'
                     RETURNING sync_status = 'SYNCED'",
                    kind.table()
                ),
                params![pushed_version, server_updated_at, id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(synced.unwrap_or(false))
    }

    fn mark_conflict(
        &self,
        kind: EntityKind,
        id: &EntityId,
        snapshot: &ConflictSnapshot,
    ) -> Result<()> {
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET sync_status = 'CONFLICT', conflict_data = ? WHERE id = ?",
                kind.table()
            ),
            params![serde_json::to_string(snapshot)?, id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("{kind} {id}")));
        }
        Ok(())
    }

    fn requeue_local(
        &self,
        kind: EntityKind,
        id: &EntityId,
        version: i64,
        server_version: i64,
        server_updated_at: i64,
        now: i64,
    ) -> Result<()> {
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET version = ?, server_version = ?, server_updated_at = ?,
                 sync_status = 'PENDING_UPLOAD', conflict_data = NULL, deleted_at = NULL,
                 local_updated_at = ? WHERE id = ?",
                kind.table()
            ),
            params![version, server_version, server_updated_at, now, id.as_str()],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("{kind} {id}")));
        }
        Ok(())
    }

    fn upsert_synced(&self, entity: &StoredEntity) -> Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} ({COLUMNS}) VALUES (?1, ?2, ?3, 'SYNCED', ?4, ?5, ?6, ?6, ?7, NULL)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    data = excluded.data,
                    sync_status = 'SYNCED',
                    server_updated_at = excluded.server_updated_at,
                    version = excluded.version,
                    server_version = excluded.server_version,
                    deleted_at = excluded.deleted_at,
                    conflict_data = NULL",
                entity.kind.table()
            ),
            params![
                entity.id.as_str(),
                entity.user_id,
                entity.data.to_data_json()?,
                entity.sync.local_updated_at,
                entity.sync.server_updated_at,
                entity.sync.version,
                entity.sync.deleted_at,
            ],
        )?;
        Ok(())
    }

    fn apply_tombstone(
        &self,
        kind: EntityKind,
        id: &EntityId,
        version: i64,
        server_updated_at: i64,
        deleted_at: i64,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            &format!(
                "UPDATE {} SET sync_status = 'SYNCED', version = ?1, server_version = ?1,
                 server_updated_at = ?2, deleted_at = ?3, conflict_data = NULL WHERE id = ?4",
                kind.table()
            ),
            params![version, server_updated_at, deleted_at, id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn remove(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let rows = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?", kind.table()),
            params![id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn count_by_status(&self, kind: EntityKind, status: SyncStatus) -> Result<usize> {
        let count = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE sync_status = ?",
                kind.table()
            ),
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn clear(&self, kind: EntityKind) -> Result<usize> {
        let rows = self
            .conn
            .execute(&format!("DELETE FROM {}", kind.table()), [])?;
        Ok(rows)
    }
}
