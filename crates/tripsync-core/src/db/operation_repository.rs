//! Pending operation repository implementation

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::models::{
    EntityId, EntityKind, OperationAction, OperationId, OperationPayload, OperationStatus,
    PendingOperation,
};
use crate::util::duration_ms;
use rusqlite::{params, Connection, OptionalExtension};

const COLUMNS: &str = "id, entity_type, entity_id, action, payload, priority, retry_count, \
                       status, last_attempt_at, last_error, created_at";

/// FIFO by insertion time; priority and insertion sequence break ties
const QUEUE_ORDER: &str = "created_at ASC, priority ASC, seq ASC";

/// Trait for operation queue storage
///
/// Read-modify-write methods do not open their own transaction; callers that
/// need them atomic with other writes wrap the calls in one.
pub trait OperationRepository {
    /// Queue a mutation, coalescing with the entity's outstanding row if any
    fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
        action: OperationAction,
        payload: &OperationPayload,
        priority: i32,
        now: i64,
    ) -> Result<PendingOperation>;

    /// Get an operation by id
    fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>>;

    /// Get the outstanding operation for an entity
    fn get_for_entity(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
    ) -> Result<Option<PendingOperation>>;

    /// Remove an operation unconditionally; returns whether it existed
    fn dequeue(&self, id: &OperationId) -> Result<bool>;

    /// Handle a server acknowledgement of `acked_version`.
    ///
    /// Removes the row only if its payload is still that version. A row
    /// superseded by a newer enqueue stays queued, rebased on the acked
    /// version. Returns whether the row was removed.
    fn acknowledge(&self, id: &OperationId, acked_version: i64) -> Result<bool>;

    /// Pending operations whose backoff has elapsed, oldest first
    fn ready_for_retry(
        &self,
        now: i64,
        batch_size: usize,
        retry: &RetryConfig,
    ) -> Result<Vec<PendingOperation>>;

    /// Record a failed attempt; marks the row failed once the budget is spent
    fn increment_retry_count(
        &self,
        id: &OperationId,
        error: &str,
        now: i64,
        max_retries: u32,
    ) -> Result<Option<PendingOperation>>;

    /// Operations whose retry budget is exhausted
    fn failed(&self) -> Result<Vec<PendingOperation>>;

    fn failed_count(&self) -> Result<usize>;

    /// Operations still eligible for delivery
    fn pending_count(&self) -> Result<usize>;

    /// Every queued row in delivery order
    fn list(&self) -> Result<Vec<PendingOperation>>;

    /// Clear retry state and restore `PENDING`; returns whether it existed
    fn reset_retry(&self, id: &OperationId) -> Result<bool>;

    /// Reset every failed operation; returns the number reset
    fn reset_all_failed(&self) -> Result<usize>;

    /// Whether a delete is queued for the entity
    fn has_pending_delete(&self, kind: EntityKind, entity_id: &EntityId) -> Result<bool>;

    /// Drop every queued row for an entity
    fn remove_for_entity(&self, kind: EntityKind, entity_id: &EntityId) -> Result<usize>;

    /// Drop the whole queue
    fn clear(&self) -> Result<usize>;
}

/// `SQLite` implementation of `OperationRepository`
pub struct SqliteOperationRepository<'a> {
    conn: &'a Connection,
}

struct RawOperationRow {
    id: String,
    entity_type: String,
    entity_id: String,
    action: String,
    payload: String,
    priority: i32,
    retry_count: u32,
    status: String,
    last_attempt_at: Option<i64>,
    last_error: Option<String>,
    created_at: i64,
}

impl RawOperationRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            action: row.get(3)?,
            payload: row.get(4)?,
            priority: row.get(5)?,
            retry_count: row.get(6)?,
            status: row.get(7)?,
            last_attempt_at: row.get(8)?,
            last_error: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_operation(self) -> Result<PendingOperation> {
        Ok(PendingOperation {
            id: self
                .id
                .parse()
                .map_err(|_| Error::InvalidInput(format!("Invalid operation ID '{}'", self.id)))?,
            entity_kind: self.entity_type.parse()?,
            entity_id: self.entity_id.parse().map_err(|_| {
                Error::InvalidInput(format!("Invalid entity ID '{}'", self.entity_id))
            })?,
            action: self.action.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            priority: self.priority,
            retry_count: self.retry_count,
            status: self.status.parse()?,
            last_attempt_at: self.last_attempt_at,
            last_error: self.last_error,
            created_at: self.created_at,
        })
    }
}

impl<'a> SqliteOperationRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn query_operations(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PendingOperation>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawOperationRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawOperationRow::into_operation).collect()
    }

    fn count_with_status(&self, status: OperationStatus) -> Result<usize> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE status = ?",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl OperationRepository for SqliteOperationRepository<'_> {
    fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
        action: OperationAction,
        payload: &OperationPayload,
        priority: i32,
        now: i64,
    ) -> Result<PendingOperation> {
        let operation = match self.get_for_entity(kind, entity_id)? {
            Some(existing) => {
                let merged = PendingOperation {
                    action: existing.action.coalesce(action),
                    payload: payload.clone(),
                    priority: existing.priority.min(priority),
                    retry_count: 0,
                    status: OperationStatus::Pending,
                    last_attempt_at: None,
                    last_error: None,
                    ..existing
                };
                self.conn.execute(
                    "UPDATE pending_operations SET action = ?, payload = ?, priority = ?,
                     retry_count = 0, status = 'PENDING', last_attempt_at = NULL,
                     last_error = NULL WHERE id = ?",
                    params![
                        merged.action.as_str(),
                        serde_json::to_string(&merged.payload)?,
                        merged.priority,
                        merged.id.as_str(),
                    ],
                )?;
                tracing::debug!(
                    "Coalesced {} for {kind} {entity_id} into operation {}",
                    action.as_str(),
                    merged.id
                );
                merged
            }
            None => {
                let operation = PendingOperation {
                    id: OperationId::new(),
                    entity_kind: kind,
                    entity_id: *entity_id,
                    action,
                    payload: payload.clone(),
                    priority,
                    retry_count: 0,
                    status: OperationStatus::Pending,
                    last_attempt_at: None,
                    last_error: None,
                    created_at: now,
                };
                self.conn.execute(
                    &format!(
                        "INSERT INTO pending_operations ({COLUMNS})
                         VALUES (?, ?, ?, ?, ?, ?, 0, 'PENDING', NULL, NULL, ?)"
                    ),
                    params![
                        operation.id.as_str(),
                        kind.as_str(),
                        entity_id.as_str(),
                        action.as_str(),
                        serde_json::to_string(payload)?,
                        priority,
                        now,
                    ],
                )?;
                tracing::debug!(
                    "Queued {} for {kind} {entity_id} as operation {}",
                    action.as_str(),
                    operation.id
                );
                operation
            }
        };

        Ok(operation)
    }

    fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM pending_operations WHERE id = ?"),
                params![id.as_str()],
                RawOperationRow::read,
            )
            .optional()?;

        raw.map(RawOperationRow::into_operation).transpose()
    }

    fn get_for_entity(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
    ) -> Result<Option<PendingOperation>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM pending_operations
                     WHERE entity_type = ? AND entity_id = ?
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![kind.as_str(), entity_id.as_str()],
                RawOperationRow::read,
            )
            .optional()?;

        raw.map(RawOperationRow::into_operation).transpose()
    }

    fn dequeue(&self, id: &OperationId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM pending_operations WHERE id = ?",
            params![id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn acknowledge(&self, id: &OperationId, acked_version: i64) -> Result<bool> {
        let Some(operation) = self.get(id)? else {
            return Ok(false);
        };

        let removed = if operation.payload.version == acked_version {
            self.conn.execute(
                "DELETE FROM pending_operations WHERE id = ?",
                params![id.as_str()],
            )?;
            true
        } else {
            // The server now holds the entity, so a pending create becomes an update
            let action = match operation.action {
                OperationAction::Create => OperationAction::Update,
                other => other,
            };
            let payload = OperationPayload {
                base_version: Some(acked_version),
                ..operation.payload
            };
            self.conn.execute(
                "UPDATE pending_operations SET action = ?, payload = ? WHERE id = ?",
                params![action.as_str(), serde_json::to_string(&payload)?, id.as_str()],
            )?;
            false
        };

        Ok(removed)
    }

    fn ready_for_retry(
        &self,
        now: i64,
        batch_size: usize,
        retry: &RetryConfig,
    ) -> Result<Vec<PendingOperation>> {
        let candidates = self.query_operations(
            &format!(
                "SELECT {COLUMNS} FROM pending_operations
                 WHERE status = 'PENDING' AND retry_count < ?
                 ORDER BY {QUEUE_ORDER}"
            ),
            params![retry.max_retries],
        )?;

        Ok(candidates
            .into_iter()
            .filter(|operation| match operation.last_attempt_at {
                None => true,
                Some(attempted) => {
                    attempted.saturating_add(duration_ms(retry.backoff(operation.retry_count)))
                        <= now
                }
            })
            .take(batch_size)
            .collect())
    }

    fn increment_retry_count(
        &self,
        id: &OperationId,
        error: &str,
        now: i64,
        max_retries: u32,
    ) -> Result<Option<PendingOperation>> {
        self.conn.execute(
            "UPDATE pending_operations SET
                retry_count = retry_count + 1,
                last_attempt_at = ?1,
                last_error = ?2,
                status = CASE WHEN retry_count + 1 >= ?3 THEN 'FAILED' ELSE status END
             WHERE id = ?4",
            params![now, error, max_retries, id.as_str()],
        )?;

        let operation = self.get(id)?;
        if let Some(operation) = &operation {
            if operation.status == OperationStatus::Failed {
                tracing::warn!(
                    "Operation {} for {} {} failed permanently after {} attempts: {error}",
                    operation.id,
                    operation.entity_kind,
                    operation.entity_id,
                    operation.retry_count
                );
            }
        }
        Ok(operation)
    }

    fn failed(&self) -> Result<Vec<PendingOperation>> {
        self.query_operations(
            &format!(
                "SELECT {COLUMNS} FROM pending_operations WHERE status = 'FAILED'
                 ORDER BY {QUEUE_ORDER}"
            ),
            [],
        )
    }

    fn failed_count(&self) -> Result<usize> {
        self.count_with_status(OperationStatus::Failed)
    }

    fn pending_count(&self) -> Result<usize> {
        self.count_with_status(OperationStatus::Pending)
    }

    fn list(&self) -> Result<Vec<PendingOperation>> {
        self.query_operations(
            &format!("SELECT {COLUMNS} FROM pending_operations ORDER BY {QUEUE_ORDER}"),
            [],
        )
    }

    fn reset_retry(&self, id: &OperationId) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE pending_operations SET retry_count = 0, last_attempt_at = NULL,
             last_error = NULL, status = 'PENDING' WHERE id = ?",
            params![id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn reset_all_failed(&self) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE pending_operations SET retry_count = 0, last_attempt_at = NULL,
             last_error = NULL, status = 'PENDING' WHERE status = 'FAILED'",
            [],
        )?;
        Ok(rows)
    }

    fn has_pending_delete(&self, kind: EntityKind, entity_id: &EntityId) -> Result<bool> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_operations
             WHERE entity_type = ? AND entity_id = ? AND action = 'DELETE')",
            params![kind.as_str(), entity_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn remove_for_entity(&self, kind: EntityKind, entity_id: &EntityId) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM pending_operations WHERE entity_type = ? AND entity_id = ?",
            params![kind.as_str(), entity_id.as_str()],
        )?;
        Ok(rows)
    }

    fn clear(&self) -> Result<usize> {
        let rows = self.conn.execute("DELETE FROM pending_operations", [])?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{SyncEntity, Vehicle, PRIORITY_EXPEDITED, PRIORITY_NORMAL};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn payload(version: i64) -> OperationPayload {
        OperationPayload {
            version,
            base_version: None,
            data: Some(Vehicle::new(format!("v{version}")).into_payload()),
        }
    }

    fn retry() -> RetryConfig {
        RetryConfig::default()
            .with_max_retries(5)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
    }

    #[test]
    fn test_enqueue_and_get() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        let id = EntityId::new();

        let op = repo
            .enqueue(
                EntityKind::Vehicle,
                &id,
                OperationAction::Create,
                &payload(1),
                PRIORITY_NORMAL,
                100,
            )
            .unwrap();

        assert_eq!(repo.get(&op.id).unwrap(), Some(op.clone()));
        assert_eq!(
            repo.get_for_entity(EntityKind::Vehicle, &id).unwrap(),
            Some(op)
        );
        assert_eq!(repo.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_enqueue_coalesces_per_entity() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        let id = EntityId::new();

        let first = repo
            .enqueue(
                EntityKind::Vehicle,
                &id,
                OperationAction::Create,
                &payload(1),
                PRIORITY_NORMAL,
                100,
            )
            .unwrap();
        let second = repo
            .enqueue(
                EntityKind::Vehicle,
                &id,
                OperationAction::Update,
                &payload(2),
                PRIORITY_NORMAL,
                200,
            )
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.action, OperationAction::Create);
        assert_eq!(second.payload, payload(2));
        assert_eq!(second.created_at, 100);
        assert_eq!(repo.list().unwrap().len(), 1);

        let third = repo
            .enqueue(
                EntityKind::Vehicle,
                &id,
                OperationAction::Delete,
                &OperationPayload {
                    version: 3,
                    base_version: None,
                    data: None,
                },
                PRIORITY_EXPEDITED,
                300,
            )
            .unwrap();
        assert_eq!(third.action, OperationAction::Delete);
        assert_eq!(third.priority, PRIORITY_EXPEDITED);
        assert!(repo.has_pending_delete(EntityKind::Vehicle, &id).unwrap());
    }

    #[test]
    fn test_ready_for_retry_orders_and_limits() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());

        let mut ids = Vec::new();
        for n in 0..25 {
            let op = repo
                .enqueue(
                    EntityKind::Trip,
                    &EntityId::new(),
                    OperationAction::Create,
                    &payload(1),
                    PRIORITY_NORMAL,
                    1_000 - n,
                )
                .unwrap();
            ids.push(op.id);
        }

        let ready = repo.ready_for_retry(10_000, 20, &retry()).unwrap();
        assert_eq!(ready.len(), 20);
        assert!(ready
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at));
        assert_eq!(ready[0].id, ids[24]);
    }

    #[test]
    fn test_ready_for_retry_respects_backoff() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        let op = repo
            .enqueue(
                EntityKind::Trip,
                &EntityId::new(),
                OperationAction::Update,
                &payload(1),
                PRIORITY_NORMAL,
                0,
            )
            .unwrap();

        // retry_count 1 -> 2s backoff with a 1s base
        repo.increment_retry_count(&op.id, "boom", 10_000, 5)
            .unwrap();

        assert!(repo.ready_for_retry(11_999, 20, &retry()).unwrap().is_empty());
        assert_eq!(repo.ready_for_retry(12_000, 20, &retry()).unwrap().len(), 1);
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        let op = repo
            .enqueue(
                EntityKind::Trip,
                &EntityId::new(),
                OperationAction::Update,
                &payload(1),
                PRIORITY_NORMAL,
                0,
            )
            .unwrap();

        let mut last = None;
        for attempt in 0..5 {
            last = repo
                .increment_retry_count(&op.id, "server unavailable", attempt, 5)
                .unwrap();
        }

        let last = last.unwrap();
        assert_eq!(last.retry_count, 5);
        assert_eq!(last.status, OperationStatus::Failed);
        assert_eq!(last.last_error.as_deref(), Some("server unavailable"));
        assert_eq!(repo.failed_count().unwrap(), 1);
        assert_eq!(repo.failed().unwrap()[0].id, op.id);
        assert!(repo
            .ready_for_retry(i64::MAX / 2, 20, &retry())
            .unwrap()
            .is_empty());

        assert!(repo.reset_retry(&op.id).unwrap());
        let reset = repo.get(&op.id).unwrap().unwrap();
        assert_eq!(reset.retry_count, 0);
        assert_eq!(reset.status, OperationStatus::Pending);
        assert!(reset.last_attempt_at.is_none());
        assert!(reset.last_error.is_none());
    }

    #[test]
    fn test_acknowledge_current_version_removes() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        let op = repo
            .enqueue(
                EntityKind::Vehicle,
                &EntityId::new(),
                OperationAction::Create,
                &payload(1),
                PRIORITY_NORMAL,
                0,
            )
            .unwrap();

        assert!(repo.acknowledge(&op.id, 1).unwrap());
        assert!(repo.get(&op.id).unwrap().is_none());
        assert!(!repo.acknowledge(&op.id, 1).unwrap());
    }

    #[test]
    fn test_acknowledge_superseded_rebases() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        let id = EntityId::new();
        let op = repo
            .enqueue(
                EntityKind::Vehicle,
                &id,
                OperationAction::Create,
                &payload(1),
                PRIORITY_NORMAL,
                0,
            )
            .unwrap();
        repo.enqueue(
            EntityKind::Vehicle,
            &id,
            OperationAction::Update,
            &payload(2),
            PRIORITY_NORMAL,
            10,
        )
        .unwrap();

        assert!(!repo.acknowledge(&op.id, 1).unwrap());
        let remaining = repo.get(&op.id).unwrap().unwrap();
        assert_eq!(remaining.action, OperationAction::Update);
        assert_eq!(remaining.payload.version, 2);
        assert_eq!(remaining.payload.base_version, Some(1));
    }

    #[test]
    fn test_reset_all_failed_and_clear() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        for _ in 0..3 {
            let op = repo
                .enqueue(
                    EntityKind::Trip,
                    &EntityId::new(),
                    OperationAction::Create,
                    &payload(1),
                    PRIORITY_NORMAL,
                    0,
                )
                .unwrap();
            repo.increment_retry_count(&op.id, "boom", 0, 1).unwrap();
        }

        assert_eq!(repo.failed_count().unwrap(), 3);
        assert_eq!(repo.reset_all_failed().unwrap(), 3);
        assert_eq!(repo.pending_count().unwrap(), 3);
        assert_eq!(repo.clear().unwrap(), 3);
    }

    #[test]
    fn test_remove_for_entity() {
        let db = setup();
        let repo = SqliteOperationRepository::new(db.connection());
        let id = EntityId::new();
        repo.enqueue(
            EntityKind::Trip,
            &id,
            OperationAction::Update,
            &payload(2),
            PRIORITY_NORMAL,
            0,
        )
        .unwrap();

        assert_eq!(repo.remove_for_entity(EntityKind::Trip, &id).unwrap(), 1);
        assert!(repo.get_for_entity(EntityKind::Trip, &id).unwrap().is_none());
    }
}
