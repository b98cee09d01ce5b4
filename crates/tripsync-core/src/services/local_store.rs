//! Local store service: typed CRUD over synchronized entities.
//!
//! Every user-facing mutation writes the row and its queued operation under
//! one lock, then publishes a [`StoreEvent`] so live views refresh without
//! waiting for a sync. The sync engine writes back through the same service.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{broadcast, Mutex};

use crate::config::ConflictPolicy;
use crate::db::{
    ConflictRepository, Database, EntityRepository, OperationRepository,
    SqliteConflictRepository, SqliteEntityRepository, SqliteOperationRepository, StoredEntity,
};
use crate::models::{
    ConflictResolution, ConflictSnapshot, EntityId, EntityKind, OperationAction, OperationId,
    OperationPayload, PendingOperation, SyncConflict, SyncEntity, SyncMeta, SyncStatus, SyncedRecord,
    PRIORITY_EXPEDITED, PRIORITY_NORMAL,
};
use crate::sync::{Classification, ConflictResolver, RemoteRow};
use crate::util::now_ms;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 256;

/// Change notification for in-process observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Changed { kind: EntityKind, id: EntityId },
    Removed { kind: EntityKind, id: EntityId },
    /// Every entity was dropped (logout)
    Cleared,
}

/// Effect of merging one server row or push conflict into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing to apply
    Unchanged,
    /// Server state written locally
    Applied,
    /// Tombstone for a record never stored here
    Ignored,
    /// Record parked in `CONFLICT`
    Conflict,
    /// Conflict detected and settled by the configured policy
    Resolved(ConflictResolution),
}

/// Thread-safe service over the entity tables.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { db, events }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Typed CRUD
    // -----------------------------------------------------------------------

    /// Create a record locally and queue its upload
    pub async fn create<T: SyncEntity>(&self, user_id: &str, data: T) -> Result<SyncedRecord<T>> {
        data.validate()?;
        let now = now_ms();
        let entity = StoredEntity {
            kind: T::KIND,
            id: EntityId::new(),
            user_id: user_id.to_string(),
            data: data.into_payload(),
            sync: SyncMeta::new_local(now),
            conflict: None,
        };

        {
            let db = self.db.lock().await;
            let conn = db.connection();
            let tx = conn.unchecked_transaction()?;
            SqliteEntityRepository::new(conn).insert(&entity)?;
            SqliteOperationRepository::new(conn).enqueue(
                entity.kind,
                &entity.id,
                OperationAction::Create,
                &OperationPayload {
                    version: entity.sync.version,
                    base_version: None,
                    data: Some(entity.data.clone()),
                },
                PRIORITY_NORMAL,
                now,
            )?;
            tx.commit()?;
        }

        tracing::debug!("Created {} {}", entity.kind, entity.id);
        self.notify(StoreEvent::Changed {
            kind: entity.kind,
            id: entity.id,
        });
        into_record(entity)
    }

    /// Replace a record's fields, bump its version and queue the upload
    pub async fn update<T: SyncEntity>(&self, id: &EntityId, data: T) -> Result<SyncedRecord<T>> {
        data.validate()?;
        let now = now_ms();
        let payload = data.into_payload();

        let entity = {
            let db = self.db.lock().await;
            let conn = db.connection();
            let entities = SqliteEntityRepository::new(conn);
            let tx = conn.unchecked_transaction()?;

            live_entity(&entities, T::KIND, id)?;
            let sync = entities.update_data(T::KIND, id, &payload, now)?;
            SqliteOperationRepository::new(conn).enqueue(
                T::KIND,
                id,
                OperationAction::Update,
                &OperationPayload {
                    version: sync.version,
                    base_version: sync.server_version,
                    data: Some(payload),
                },
                PRIORITY_NORMAL,
                now,
            )?;
            let entity = live_entity(&entities, T::KIND, id)?;
            tx.commit()?;
            entity
        };

        tracing::debug!("Updated {} {} to version {}", T::KIND, id, entity.sync.version);
        self.notify(StoreEvent::Changed { kind: T::KIND, id: *id });
        into_record(entity)
    }

    /// Delete a record; returns false if it did not exist
    pub async fn delete<T: SyncEntity>(&self, id: &EntityId) -> Result<bool> {
        self.delete_entity(T::KIND, id).await
    }

    /// Delete a record of any kind.
    ///
    /// The DELETE is committed to the queue before the row is removed, so an
    /// interruption between the two steps leaves the intent durable.
    pub async fn delete_entity(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let now = now_ms();
        let db = self.db.lock().await;
        let conn = db.connection();
        let entities = SqliteEntityRepository::new(conn);

        let Some(entity) = entities.get(kind, id)? else {
            return Ok(false);
        };
        if entity.sync.sync_status == SyncStatus::Conflict {
            return Err(Error::InvalidState(format!(
                "{kind} {id} is in conflict and must be resolved first"
            )));
        }

        SqliteOperationRepository::new(conn).enqueue(
            kind,
            id,
            OperationAction::Delete,
            &OperationPayload {
                version: entity.sync.version + 1,
                base_version: entity.sync.server_version,
                data: None,
            },
            PRIORITY_EXPEDITED,
            now,
        )?;
        entities.remove(kind, id)?;
        drop(db);

        tracing::debug!("Deleted {kind} {id}");
        self.notify(StoreEvent::Removed { kind, id: *id });
        Ok(true)
    }

    /// Get a live record
    pub async fn get<T: SyncEntity>(&self, id: &EntityId) -> Result<Option<SyncedRecord<T>>> {
        let db = self.db.lock().await;
        let entity = SqliteEntityRepository::new(db.connection()).get(T::KIND, id)?;
        entity
            .filter(|entity| entity.sync.deleted_at.is_none())
            .map(into_record)
            .transpose()
    }

    /// List live records, optionally restricted to one user
    pub async fn list<T: SyncEntity>(&self, user_id: Option<&str>) -> Result<Vec<SyncedRecord<T>>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection())
            .list(T::KIND, user_id)?
            .into_iter()
            .map(into_record)
            .collect()
    }

    /// Raw row, including tombstones and any parked conflict snapshot
    pub async fn get_entity(&self, kind: EntityKind, id: &EntityId) -> Result<Option<StoredEntity>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).get(kind, id)
    }

    pub async fn list_by_status(
        &self,
        kind: EntityKind,
        status: SyncStatus,
    ) -> Result<Vec<StoredEntity>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).list_by_status(kind, status)
    }

    pub async fn list_needing_sync(&self, kind: EntityKind) -> Result<Vec<StoredEntity>> {
        let db = self.db.lock().await;
        SqliteEntityRepository::new(db.connection()).list_needing_sync(kind)
    }

    /// Records of every kind awaiting conflict resolution
    pub async fn list_conflicts(&self) -> Result<Vec<StoredEntity>> {
        let db = self.db.lock().await;
        let entities = SqliteEntityRepository::new(db.connection());
        let mut conflicts = Vec::new();
        for kind in EntityKind::ALL {
            conflicts.extend(entities.list_by_status(kind, SyncStatus::Conflict)?);
        }
        Ok(conflicts)
    }

    // -----------------------------------------------------------------------
    // Sync state transitions
    // -----------------------------------------------------------------------

    /// Bump the version and flag the record for upload
    pub async fn mark_needing_sync(&self, kind: EntityKind, id: &EntityId) -> Result<i64> {
        let version = {
            let db = self.db.lock().await;
            SqliteEntityRepository::new(db.connection()).mark_needing_sync(kind, id, now_ms())?
        };
        self.notify(StoreEvent::Changed { kind, id: *id });
        Ok(version)
    }

    /// Record a server acknowledgement; true if the record is now `SYNCED`
    pub async fn mark_synced(
        &self,
        kind: EntityKind,
        id: &EntityId,
        pushed_version: i64,
        server_updated_at: i64,
    ) -> Result<bool> {
        let synced = {
            let db = self.db.lock().await;
            SqliteEntityRepository::new(db.connection()).mark_synced(
                kind,
                id,
                pushed_version,
                server_updated_at,
            )?
        };
        self.notify(StoreEvent::Changed { kind, id: *id });
        Ok(synced)
    }

    /// Park a record in `CONFLICT` with the server snapshot
    pub async fn mark_conflict(
        &self,
        kind: EntityKind,
        id: &EntityId,
        snapshot: &ConflictSnapshot,
    ) -> Result<()> {
        {
            let db = self.db.lock().await;
            let conn = db.connection();
            let tx = conn.unchecked_transaction()?;
            let entity = SqliteEntityRepository::new(conn)
                .get(kind, id)?
                .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))?;
            park_conflict(conn, &entity, snapshot, now_ms())?;
            tx.commit()?;
        }
        self.notify(StoreEvent::Changed { kind, id: *id });
        Ok(())
    }

    /// Settle a conflict keeping local fields; the record is re-queued
    pub async fn resolve_conflict_keep_local(&self, kind: EntityKind, id: &EntityId) -> Result<()> {
        self.resolve_conflict(kind, id, ConflictResolution::KeepLocal)
            .await
    }

    /// Settle a conflict adopting the server row; the local delta is discarded
    pub async fn resolve_conflict_keep_server(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<()> {
        self.resolve_conflict(kind, id, ConflictResolution::KeepServer)
            .await
    }

    async fn resolve_conflict(
        &self,
        kind: EntityKind,
        id: &EntityId,
        resolution: ConflictResolution,
    ) -> Result<()> {
        let removed = {
            let db = self.db.lock().await;
            let conn = db.connection();
            let tx = conn.unchecked_transaction()?;

            let entity = SqliteEntityRepository::new(conn)
                .get(kind, id)?
                .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))?;
            let snapshot = match (&entity.sync.sync_status, &entity.conflict) {
                (SyncStatus::Conflict, Some(snapshot)) => snapshot.clone(),
                _ => {
                    return Err(Error::InvalidState(format!("{kind} {id} is not in conflict")));
                }
            };

            let now = now_ms();
            let removed = match resolution {
                ConflictResolution::KeepLocal => {
                    keep_local(conn, &entity, &snapshot, now)?;
                    false
                }
                ConflictResolution::KeepServer => keep_server(conn, &entity, &snapshot, now)?,
            };
            tx.commit()?;
            removed
        };

        tracing::info!("Resolved conflict on {kind} {id}: {}", resolution.as_str());
        self.notify(if removed {
            StoreEvent::Removed { kind, id: *id }
        } else {
            StoreEvent::Changed { kind, id: *id }
        });
        Ok(())
    }

    /// Write a server row as-is, status `SYNCED`
    pub async fn apply_server_row(&self, row: &RemoteRow) -> Result<()> {
        {
            let db = self.db.lock().await;
            let conn = db.connection();
            let tx = conn.unchecked_transaction()?;
            let local = SqliteEntityRepository::new(conn).get(row.kind, &row.id)?;
            accept_server(conn, local.as_ref(), row, now_ms())?;
            tx.commit()?;
        }
        self.notify(StoreEvent::Changed {
            kind: row.kind,
            id: row.id,
        });
        Ok(())
    }

    /// Physically remove a row without queueing anything
    pub async fn remove_local(&self, kind: EntityKind, id: &EntityId) -> Result<bool> {
        let removed = {
            let db = self.db.lock().await;
            SqliteEntityRepository::new(db.connection()).remove(kind, id)?
        };
        if removed {
            self.notify(StoreEvent::Removed { kind, id: *id });
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Sync write-back
    // -----------------------------------------------------------------------

    /// Classify a pulled row against local state and commit the result
    pub async fn merge_server_row(
        &self,
        row: &RemoteRow,
        policy: ConflictPolicy,
    ) -> Result<MergeOutcome> {
        let outcome = {
            let db = self.db.lock().await;
            let conn = db.connection();
            let entities = SqliteEntityRepository::new(conn);
            let tx = conn.unchecked_transaction()?;
            let now = now_ms();

            let local = entities.get(row.kind, &row.id)?;
            let outcome = match (ConflictResolver::classify(local.as_ref(), row), local) {
                (Classification::ServerUnchanged, _) => MergeOutcome::Unchanged,
                (Classification::IgnoreTombstone, _) => MergeOutcome::Ignored,
                (Classification::AcceptServer, local) => {
                    accept_server(conn, local.as_ref(), row, now)?;
                    MergeOutcome::Applied
                }
                (Classification::RefreshConflict, _) => {
                    entities.mark_conflict(row.kind, &row.id, &row.to_snapshot())?;
                    MergeOutcome::Conflict
                }
                (Classification::Conflict, Some(entity)) => {
                    settle_conflict(conn, &entity, &row.to_snapshot(), policy, now)?
                }
                (Classification::Conflict, None) => MergeOutcome::Unchanged,
            };
            tx.commit()?;
            outcome
        };

        if !matches!(outcome, MergeOutcome::Unchanged | MergeOutcome::Ignored) {
            self.notify(StoreEvent::Changed {
                kind: row.kind,
                id: row.id,
            });
        }
        Ok(outcome)
    }

    /// Commit the server acknowledgement of a pushed operation.
    ///
    /// `pushed` is the operation as it was sent; if the entity was edited
    /// while the push was in flight, the queued row is rebased instead of
    /// removed and the record stays `PENDING_UPLOAD`. Returns whether the
    /// operation left the queue.
    pub async fn acknowledge_push(
        &self,
        pushed: &PendingOperation,
        server_updated_at: i64,
    ) -> Result<bool> {
        let (kind, id) = (pushed.entity_kind, pushed.entity_id);
        let dequeued = {
            let db = self.db.lock().await;
            let conn = db.connection();
            let entities = SqliteEntityRepository::new(conn);
            let tx = conn.unchecked_transaction()?;

            let dequeued = SqliteOperationRepository::new(conn)
                .acknowledge(&pushed.id, pushed.payload.version)?;
            match pushed.action {
                OperationAction::Delete => {
                    entities.remove(kind, &id)?;
                }
                _ => {
                    entities.mark_synced(kind, &id, pushed.payload.version, server_updated_at)?;
                }
            }
            tx.commit()?;
            dequeued
        };

        self.notify(match pushed.action {
            OperationAction::Delete => StoreEvent::Removed { kind, id },
            _ => StoreEvent::Changed { kind, id },
        });
        Ok(dequeued)
    }

    /// Handle a version conflict reported by the server for a push.
    ///
    /// The offending operation (if any) leaves the queue in the same
    /// transaction that records the conflict. `owner` is the user the push
    /// was made for; a server row restored over a local delete belongs to
    /// them.
    pub async fn resolve_push_conflict(
        &self,
        operation_id: Option<&OperationId>,
        owner: &str,
        kind: EntityKind,
        id: &EntityId,
        snapshot: &ConflictSnapshot,
        policy: ConflictPolicy,
    ) -> Result<MergeOutcome> {
        let outcome = {
            let db = self.db.lock().await;
            let conn = db.connection();
            let tx = conn.unchecked_transaction()?;
            let now = now_ms();

            if let Some(operation_id) = operation_id {
                SqliteOperationRepository::new(conn).dequeue(operation_id)?;
            }
            let outcome = match SqliteEntityRepository::new(conn).get(kind, id)? {
                Some(entity) => settle_conflict(conn, &entity, snapshot, policy, now)?,
                None => settle_deleted_conflict(conn, owner, kind, id, snapshot, policy, now)?,
            };
            tx.commit()?;
            outcome
        };

        self.notify(StoreEvent::Changed { kind, id: *id });
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Degraded counters and housekeeping
    // -----------------------------------------------------------------------

    /// Records awaiting upload; 0 if the store cannot be read
    pub async fn pending_sync_count(&self) -> usize {
        self.count_status(SyncStatus::PendingUpload).await
    }

    /// Records awaiting conflict resolution; 0 if the store cannot be read
    pub async fn conflict_count(&self) -> usize {
        self.count_status(SyncStatus::Conflict).await
    }

    async fn count_status(&self, status: SyncStatus) -> usize {
        let db = self.db.lock().await;
        let entities = SqliteEntityRepository::new(db.connection());
        EntityKind::ALL
            .into_iter()
            .map(|kind| {
                entities.count_by_status(kind, status).unwrap_or_else(|error| {
                    tracing::warn!("Failed to count {} {kind} records: {error}", status.as_str());
                    0
                })
            })
            .sum()
    }

    /// Most recent conflicts, resolved or not
    pub async fn conflict_history(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).list_recent(limit)
    }

    /// Drop every entity and the conflict log
    pub async fn clear_all(&self) -> Result<()> {
        {
            let db = self.db.lock().await;
            let conn = db.connection();
            let entities = SqliteEntityRepository::new(conn);
            let tx = conn.unchecked_transaction()?;
            for kind in EntityKind::ALL {
                entities.clear(kind)?;
            }
            SqliteConflictRepository::new(conn).clear()?;
            tx.commit()?;
        }
        self.notify(StoreEvent::Cleared);
        Ok(())
    }
}

fn into_record<T: SyncEntity>(entity: StoredEntity) -> Result<SyncedRecord<T>> {
    let kind = entity.kind;
    let data = T::from_payload(entity.data).ok_or_else(|| {
        Error::InvalidState(format!("{kind} row does not hold {} data", T::KIND))
    })?;
    Ok(SyncedRecord {
        id: entity.id,
        user_id: entity.user_id,
        data,
        sync: entity.sync,
    })
}

fn live_entity(
    entities: &SqliteEntityRepository<'_>,
    kind: EntityKind,
    id: &EntityId,
) -> Result<StoredEntity> {
    entities
        .get(kind, id)?
        .filter(|entity| entity.sync.deleted_at.is_none())
        .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))
}

/// Write server state over the local row; queued operations the row already
/// covers are acknowledged
fn accept_server(
    conn: &Connection,
    local: Option<&StoredEntity>,
    row: &RemoteRow,
    now: i64,
) -> Result<()> {
    let entities = SqliteEntityRepository::new(conn);
    let operations = SqliteOperationRepository::new(conn);

    match &row.data {
        Some(data) if !row.is_deleted() => entities.upsert_synced(&StoredEntity {
            kind: row.kind,
            id: row.id,
            user_id: row.user_id.clone(),
            data: data.clone(),
            sync: SyncMeta {
                sync_status: SyncStatus::Synced,
                local_updated_at: local.map_or(now, |local| local.sync.local_updated_at),
                server_updated_at: Some(row.updated_at),
                version: row.version,
                server_version: Some(row.version),
                deleted_at: None,
            },
            conflict: None,
        })?,
        _ => {
            entities.apply_tombstone(
                row.kind,
                &row.id,
                row.version,
                row.updated_at,
                row.deleted_at.unwrap_or(row.updated_at),
            )?;
        }
    }

    if let Some(operation) = operations.get_for_entity(row.kind, &row.id)? {
        operations.acknowledge(&operation.id, row.version)?;
    }
    Ok(())
}

/// Move a record into `CONFLICT`, logging the transition once
fn park_conflict(
    conn: &Connection,
    entity: &StoredEntity,
    snapshot: &ConflictSnapshot,
    now: i64,
) -> Result<()> {
    if entity.sync.sync_status != SyncStatus::Conflict {
        SqliteConflictRepository::new(conn).log(
            entity.kind,
            &entity.id,
            entity.sync.version,
            snapshot.version,
            now,
        )?;
        tracing::warn!(
            "Conflict on {} {}: local version {} vs server version {}",
            entity.kind,
            entity.id,
            entity.sync.version,
            snapshot.version
        );
    }
    SqliteEntityRepository::new(conn).mark_conflict(entity.kind, &entity.id, snapshot)?;
    // Stale until a side is picked
    SqliteOperationRepository::new(conn).remove_for_entity(entity.kind, &entity.id)?;
    Ok(())
}

fn settle_conflict(
    conn: &Connection,
    entity: &StoredEntity,
    snapshot: &ConflictSnapshot,
    policy: ConflictPolicy,
    now: i64,
) -> Result<MergeOutcome> {
    park_conflict(conn, entity, snapshot, now)?;
    match policy {
        ConflictPolicy::Manual => Ok(MergeOutcome::Conflict),
        ConflictPolicy::PreferLocal => {
            keep_local(conn, entity, snapshot, now)?;
            Ok(MergeOutcome::Resolved(ConflictResolution::KeepLocal))
        }
        ConflictPolicy::PreferServer => {
            keep_server(conn, entity, snapshot, now)?;
            Ok(MergeOutcome::Resolved(ConflictResolution::KeepServer))
        }
    }
}

/// Conflict on a record already deleted locally: there is no row to park,
/// so only `prefer_local` repeats the delete; otherwise the server row returns
fn settle_deleted_conflict(
    conn: &Connection,
    owner: &str,
    kind: EntityKind,
    id: &EntityId,
    snapshot: &ConflictSnapshot,
    policy: ConflictPolicy,
    now: i64,
) -> Result<MergeOutcome> {
    let conflicts = SqliteConflictRepository::new(conn);
    conflicts.log(kind, id, snapshot.version, snapshot.version, now)?;

    let resolution = if policy == ConflictPolicy::PreferLocal {
        SqliteOperationRepository::new(conn).enqueue(
            kind,
            id,
            OperationAction::Delete,
            &OperationPayload {
                version: snapshot.version + 1,
                base_version: Some(snapshot.version),
                data: None,
            },
            PRIORITY_EXPEDITED,
            now,
        )?;
        ConflictResolution::KeepLocal
    } else {
        if let (Some(data), None) = (&snapshot.payload, snapshot.deleted_at) {
            SqliteEntityRepository::new(conn).upsert_synced(&StoredEntity {
                kind,
                id: *id,
                user_id: owner.to_string(),
                data: data.clone(),
                sync: SyncMeta {
                    sync_status: SyncStatus::Synced,
                    local_updated_at: now,
                    server_updated_at: Some(snapshot.updated_at),
                    version: snapshot.version,
                    server_version: Some(snapshot.version),
                    deleted_at: None,
                },
                conflict: None,
            })?;
        }
        ConflictResolution::KeepServer
    };

    conflicts.resolve(kind, id, resolution, now)?;
    tracing::warn!(
        "Delete of {kind} {id} conflicted with server version {}; {}",
        snapshot.version,
        resolution.as_str()
    );
    Ok(MergeOutcome::Resolved(resolution))
}

/// Keep local fields, rebased on the server version, and re-queue the upload
fn keep_local(
    conn: &Connection,
    entity: &StoredEntity,
    snapshot: &ConflictSnapshot,
    now: i64,
) -> Result<()> {
    let version = entity.sync.version.max(snapshot.version) + 1;
    SqliteEntityRepository::new(conn).requeue_local(
        entity.kind,
        &entity.id,
        version,
        snapshot.version,
        snapshot.updated_at,
        now,
    )?;
    SqliteOperationRepository::new(conn).enqueue(
        entity.kind,
        &entity.id,
        OperationAction::Update,
        &OperationPayload {
            version,
            base_version: Some(snapshot.version),
            data: Some(entity.data.clone()),
        },
        PRIORITY_NORMAL,
        now,
    )?;
    SqliteConflictRepository::new(conn).resolve(
        entity.kind,
        &entity.id,
        ConflictResolution::KeepLocal,
        now,
    )?;
    Ok(())
}

/// Adopt the server snapshot and drop the local delta; returns whether the
/// row was removed because the server had deleted it
fn keep_server(
    conn: &Connection,
    entity: &StoredEntity,
    snapshot: &ConflictSnapshot,
    now: i64,
) -> Result<bool> {
    let entities = SqliteEntityRepository::new(conn);
    SqliteOperationRepository::new(conn).remove_for_entity(entity.kind, &entity.id)?;

    let removed = match (&snapshot.payload, snapshot.deleted_at) {
        (Some(data), None) => {
            entities.upsert_synced(&StoredEntity {
                kind: entity.kind,
                id: entity.id,
                user_id: entity.user_id.clone(),
                data: data.clone(),
                sync: SyncMeta {
                    sync_status: SyncStatus::Synced,
                    local_updated_at: entity.sync.local_updated_at,
                    server_updated_at: Some(snapshot.updated_at),
                    version: snapshot.version,
                    server_version: Some(snapshot.version),
                    deleted_at: None,
                },
                conflict: None,
            })?;
            false
        }
        _ => entities.remove(entity.kind, &entity.id)?,
    };

    SqliteConflictRepository::new(conn).resolve(
        entity.kind,
        &entity.id,
        ConflictResolution::KeepServer,
        now,
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Trip, Vehicle};
    use pretty_assertions::assert_eq;

    fn store() -> LocalStore {
        let db = Database::open_in_memory().unwrap();
        LocalStore::new(Arc::new(Mutex::new(db)))
    }

    async fn queued(store: &LocalStore) -> Vec<crate::models::PendingOperation> {
        let db = store.db.lock().await;
        SqliteOperationRepository::new(db.connection()).list().unwrap()
    }

    fn server_row(record: &SyncedRecord<Vehicle>, name: &str, version: i64) -> RemoteRow {
        RemoteRow {
            kind: EntityKind::Vehicle,
            id: record.id,
            user_id: record.user_id.clone(),
            data: Some(Vehicle::new(name).into_payload()),
            version,
            updated_at: 50_000,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_enqueues_and_notifies() {
        let store = store();
        let mut events = store.subscribe();

        let record = store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        assert_eq!(record.sync.version, 1);
        assert_eq!(record.sync.sync_status, SyncStatus::PendingUpload);

        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::Changed {
                kind: EntityKind::Vehicle,
                id: record.id
            }
        );

        let ops = queued(&store).await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, OperationAction::Create);
        assert_eq!(ops[0].payload.version, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_data() {
        let store = store();
        let result = store.create("user-1", Vehicle::new("  ")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(queued(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_coalesces_queue() {
        let store = store();
        let record = store.create("user-1", Vehicle::new("Clio")).await.unwrap();

        let updated = store
            .update(&record.id, Vehicle::new("Megane"))
            .await
            .unwrap();
        assert_eq!(updated.sync.version, 2);
        assert_eq!(updated.data.name, "Megane");

        let ops = queued(&store).await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, OperationAction::Create);
        assert_eq!(ops[0].payload.version, 2);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let store = store();
        let result = store.update(&EntityId::new(), Vehicle::new("Ghost")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_queues_before_removal() {
        let store = store();
        let record = store.create("user-1", Trip::new(1_000)).await.unwrap();

        assert!(store.delete::<Trip>(&record.id).await.unwrap());
        assert!(store.get::<Trip>(&record.id).await.unwrap().is_none());

        let ops = queued(&store).await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, OperationAction::Delete);
        assert_eq!(ops[0].priority, PRIORITY_EXPEDITED);
        assert!(!store.delete::<Trip>(&record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_is_typed_and_scoped() {
        let store = store();
        store.create("user-1", Vehicle::new("A")).await.unwrap();
        store.create("user-2", Vehicle::new("B")).await.unwrap();
        store.create("user-1", Trip::new(0)).await.unwrap();

        assert_eq!(store.list::<Vehicle>(None).await.unwrap().len(), 2);
        assert_eq!(store.list::<Vehicle>(Some("user-1")).await.unwrap().len(), 1);
        assert_eq!(store.list::<Trip>(None).await.unwrap().len(), 1);
        assert_eq!(store.pending_sync_count().await, 3);
    }

    #[tokio::test]
    async fn test_acknowledge_marks_synced() {
        let store = store();
        let record = store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        let op = queued(&store).await.remove(0);

        assert!(store.acknowledge_push(&op, 9_000).await.unwrap());

        let fetched = store.get::<Vehicle>(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.sync.sync_status, SyncStatus::Synced);
        assert_eq!(fetched.sync.server_updated_at, Some(9_000));
        assert!(queued(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_after_concurrent_edit_keeps_pending() {
        let store = store();
        let record = store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        let in_flight = queued(&store).await.remove(0);

        store.update(&record.id, Vehicle::new("Megane")).await.unwrap();
        assert!(!store.acknowledge_push(&in_flight, 9_000).await.unwrap());

        let fetched = store.get::<Vehicle>(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.sync.sync_status, SyncStatus::PendingUpload);
        assert_eq!(queued(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_then_keep_server() {
        let store = store();
        let record = store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        let op = queued(&store).await.remove(0);
        store.acknowledge_push(&op, 1_000).await.unwrap();
        store.update(&record.id, Vehicle::new("Local edit")).await.unwrap();

        let outcome = store
            .merge_server_row(&server_row(&record, "Server edit", 2), ConflictPolicy::Manual)
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Conflict);
        assert_eq!(store.conflict_count().await, 1);
        assert!(queued(&store).await.is_empty());

        let edit = store.update(&record.id, Vehicle::new("Blocked")).await;
        assert!(matches!(edit, Err(Error::InvalidState(_))));

        store
            .resolve_conflict_keep_server(EntityKind::Vehicle, &record.id)
            .await
            .unwrap();
        let fetched = store.get::<Vehicle>(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.sync.sync_status, SyncStatus::Synced);
        assert_eq!(fetched.sync.version, 2);
        assert_eq!(fetched.data.name, "Server edit");

        let history = store.conflict_history(10).await.unwrap();
        assert_eq!(history[0].resolution, Some(ConflictResolution::KeepServer));
    }

    #[tokio::test]
    async fn test_conflict_then_keep_local() {
        let store = store();
        let record = store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        let op = queued(&store).await.remove(0);
        store.acknowledge_push(&op, 1_000).await.unwrap();
        store.update(&record.id, Vehicle::new("Local edit")).await.unwrap();

        store
            .merge_server_row(&server_row(&record, "Server edit", 4), ConflictPolicy::Manual)
            .await
            .unwrap();
        store
            .resolve_conflict_keep_local(EntityKind::Vehicle, &record.id)
            .await
            .unwrap();

        let fetched = store.get::<Vehicle>(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.sync.sync_status, SyncStatus::PendingUpload);
        assert_eq!(fetched.sync.version, 5);
        assert_eq!(fetched.sync.server_version, Some(4));
        assert_eq!(fetched.data.name, "Local edit");

        let ops = queued(&store).await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, OperationAction::Update);
        assert_eq!(ops[0].payload.base_version, Some(4));
    }

    #[tokio::test]
    async fn test_prefer_server_policy_resolves_immediately() {
        let store = store();
        let record = store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        let op = queued(&store).await.remove(0);
        store.acknowledge_push(&op, 1_000).await.unwrap();
        store.update(&record.id, Vehicle::new("Local edit")).await.unwrap();

        let outcome = store
            .merge_server_row(
                &server_row(&record, "Server edit", 2),
                ConflictPolicy::PreferServer,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Resolved(ConflictResolution::KeepServer)
        );
        assert_eq!(store.conflict_count().await, 0);
        assert_eq!(
            store.conflict_history(1).await.unwrap()[0].resolution,
            Some(ConflictResolution::KeepServer)
        );
    }

    #[tokio::test]
    async fn test_merge_inserts_unknown_and_applies_tombstones() {
        let store = store();
        let record = SyncedRecord {
            id: EntityId::new(),
            user_id: "user-1".to_string(),
            data: Vehicle::new("Remote"),
            sync: SyncMeta::new_local(0),
        };

        let row = server_row(&record, "Remote", 1);
        assert_eq!(
            store.merge_server_row(&row, ConflictPolicy::Manual).await.unwrap(),
            MergeOutcome::Applied
        );
        assert!(store.get::<Vehicle>(&record.id).await.unwrap().is_some());

        let tombstone = RemoteRow {
            version: 2,
            updated_at: 60_000,
            deleted_at: Some(60_000),
            ..row
        };
        assert_eq!(
            store
                .merge_server_row(&tombstone, ConflictPolicy::Manual)
                .await
                .unwrap(),
            MergeOutcome::Applied
        );
        assert!(store.get::<Vehicle>(&record.id).await.unwrap().is_none());
        assert!(store.list::<Vehicle>(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_conflict_restores_row_for_owner() {
        let store = store();
        let record = store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        let op = queued(&store).await.remove(0);
        store.acknowledge_push(&op, 1_000).await.unwrap();
        store.delete::<Vehicle>(&record.id).await.unwrap();
        let delete = queued(&store).await.remove(0);

        let outcome = store
            .resolve_push_conflict(
                Some(&delete.id),
                "user-1",
                EntityKind::Vehicle,
                &record.id,
                &server_row(&record, "Other device", 3).to_snapshot(),
                ConflictPolicy::Manual,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Resolved(ConflictResolution::KeepServer)
        );

        let owned = store.list::<Vehicle>(Some("user-1")).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].user_id, "user-1");
        assert_eq!(owned[0].data.name, "Other device");
        assert_eq!(owned[0].sync.sync_status, SyncStatus::Synced);
        assert!(queued(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_requires_conflict() {
        let store = store();
        let record = store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        let result = store
            .resolve_conflict_keep_local(EntityKind::Vehicle, &record.id)
            .await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_clear_all() {
        let store = store();
        let mut events = store.subscribe();
        store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        store.clear_all().await.unwrap();

        assert!(store.list::<Vehicle>(None).await.unwrap().is_empty());
        let _ = events.recv().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Cleared);
    }
}
