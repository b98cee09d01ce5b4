//! Durable outbound operation queue.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::RetryConfig;
use crate::db::{Database, OperationRepository, SqliteOperationRepository};
use crate::models::{
    EntityId, EntityKind, OperationAction, OperationId, OperationPayload, PendingOperation,
};
use crate::sync::SyncError;
use crate::util::now_ms;
use crate::Result;

/// Thread-safe service over the `pending_operations` table.
#[derive(Clone)]
pub struct PendingOperationQueue {
    db: Arc<Mutex<Database>>,
    retry: RetryConfig,
}

impl PendingOperationQueue {
    pub fn new(db: Arc<Mutex<Database>>, retry: RetryConfig) -> Self {
        Self { db, retry }
    }

    pub const fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Queue a mutation; an outstanding row for the same entity is coalesced
    pub async fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
        action: OperationAction,
        payload: OperationPayload,
        priority: i32,
    ) -> Result<PendingOperation> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let tx = conn.unchecked_transaction()?;
        let operation = SqliteOperationRepository::new(conn)
            .enqueue(kind, entity_id, action, &payload, priority, now_ms())?;
        tx.commit()?;
        Ok(operation)
    }

    pub async fn get(&self, id: &OperationId) -> Result<Option<PendingOperation>> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).get(id)
    }

    /// The outstanding operation for an entity, if any
    pub async fn get_for_entity(
        &self,
        kind: EntityKind,
        entity_id: &EntityId,
    ) -> Result<Option<PendingOperation>> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).get_for_entity(kind, entity_id)
    }

    /// Remove an operation unconditionally
    pub async fn dequeue(&self, id: &OperationId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).dequeue(id)
    }

    /// Remove the operation if `acked_version` is still its payload version
    pub async fn acknowledge(&self, id: &OperationId, acked_version: i64) -> Result<bool> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let tx = conn.unchecked_transaction()?;
        let removed = SqliteOperationRepository::new(conn).acknowledge(id, acked_version)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Up to `batch_size` operations due now, oldest first
    pub async fn ready_for_retry(&self, batch_size: usize) -> Result<Vec<PendingOperation>> {
        self.ready_for_retry_at(now_ms(), batch_size).await
    }

    pub async fn ready_for_retry_at(
        &self,
        now: i64,
        batch_size: usize,
    ) -> Result<Vec<PendingOperation>> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).ready_for_retry(
            now,
            batch_size,
            &self.retry,
        )
    }

    /// Count a failed attempt against the retry budget
    pub async fn increment_retry_count(
        &self,
        id: &OperationId,
        error: &str,
    ) -> Result<Option<PendingOperation>> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).increment_retry_count(
            id,
            error,
            now_ms(),
            self.retry.max_retries,
        )
    }

    /// Record a push failure: retryable errors consume one attempt, anything
    /// else fails the operation outright
    pub async fn record_failure(
        &self,
        id: &OperationId,
        error: &SyncError,
    ) -> Result<Option<PendingOperation>> {
        let max_retries = if error.is_retryable() {
            self.retry.max_retries
        } else {
            0
        };
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).increment_retry_count(
            id,
            &error.to_string(),
            now_ms(),
            max_retries,
        )
    }

    /// Operations that exhausted their retry budget, for user review
    pub async fn failed_uploads(&self) -> Result<Vec<PendingOperation>> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).failed()
    }

    pub async fn failed_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).failed_count()
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).pending_count()
    }

    pub async fn list(&self) -> Result<Vec<PendingOperation>> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).list()
    }

    /// Give a failed operation a fresh retry budget
    pub async fn reset_retry(&self, id: &OperationId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).reset_retry(id)
    }

    pub async fn reset_all_failed(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let reset = SqliteOperationRepository::new(db.connection()).reset_all_failed()?;
        if reset > 0 {
            tracing::info!("Reset {reset} failed uploads for retry");
        }
        Ok(reset)
    }

    pub async fn has_pending_delete(&self, kind: EntityKind, entity_id: &EntityId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).has_pending_delete(kind, entity_id)
    }

    pub async fn remove_for_entity(&self, kind: EntityKind, entity_id: &EntityId) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).remove_for_entity(kind, entity_id)
    }

    pub async fn clear(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationStatus, SyncEntity, Vehicle, PRIORITY_NORMAL};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn queue(retry: RetryConfig) -> PendingOperationQueue {
        let db = Database::open_in_memory().unwrap();
        PendingOperationQueue::new(Arc::new(Mutex::new(db)), retry)
    }

    fn payload() -> OperationPayload {
        OperationPayload {
            version: 1,
            base_version: None,
            data: Some(Vehicle::new("Clio").into_payload()),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_failure_fails_immediately() {
        let queue = queue(RetryConfig::default());
        let op = queue
            .enqueue(
                EntityKind::Vehicle,
                &EntityId::new(),
                OperationAction::Create,
                payload(),
                PRIORITY_NORMAL,
            )
            .await
            .unwrap();

        let failed = queue
            .record_failure(&op.id, &SyncError::Rejected("bad plate".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, OperationStatus::Failed);
        assert_eq!(queue.failed_count().await.unwrap(), 1);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_waits_for_backoff() {
        let queue = queue(RetryConfig::default().with_base_delay(Duration::from_secs(30)));
        let op = queue
            .enqueue(
                EntityKind::Vehicle,
                &EntityId::new(),
                OperationAction::Create,
                payload(),
                PRIORITY_NORMAL,
            )
            .await
            .unwrap();

        let retried = queue
            .record_failure(&op.id, &SyncError::Timeout)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.status, OperationStatus::Pending);
        assert_eq!(retried.retry_count, 1);

        let attempted = retried.last_attempt_at.unwrap();
        assert!(queue
            .ready_for_retry_at(attempted + 1_000, 20)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            queue
                .ready_for_retry_at(attempted + 60_000, 20)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_reset_all_failed() {
        let queue = queue(RetryConfig::default().with_max_retries(1));
        let op = queue
            .enqueue(
                EntityKind::Trip,
                &EntityId::new(),
                OperationAction::Delete,
                OperationPayload {
                    version: 2,
                    base_version: Some(1),
                    data: None,
                },
                PRIORITY_NORMAL,
            )
            .await
            .unwrap();
        queue.increment_retry_count(&op.id, "boom").await.unwrap();
        assert_eq!(queue.failed_uploads().await.unwrap().len(), 1);

        assert_eq!(queue.reset_all_failed().await.unwrap(), 1);
        assert!(queue.failed_uploads().await.unwrap().is_empty());
        assert_eq!(queue.ready_for_retry(20).await.unwrap().len(), 1);
    }
}
