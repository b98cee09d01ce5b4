//! In-process remote data source.
//!
//! Applies the same version-checked, idempotent upsert rules as the real
//! backend. Used by tests and offline demos; failures and latency can be
//! injected to exercise retry and cancellation paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::error::{SyncError, SyncResult};
use super::remote::{
    Applied, BatchResult, Change, PushOutcome, RejectReason, RemoteDataSource, RemoteRow,
};
use crate::models::{EntityId, EntityKind, EntityPayload};
use crate::util::now_ms;

#[derive(Debug, Default)]
struct MemoryState {
    rows: HashMap<(EntityKind, EntityId), RemoteRow>,
    /// Last server timestamp handed out; strictly increasing
    clock: i64,
    /// Errors returned by the next calls, oldest first
    failures: Vec<SyncError>,
    latency: Option<Duration>,
}

impl MemoryState {
    fn tick(&mut self) -> i64 {
        self.clock = now_ms().max(self.clock + 1);
        self.clock
    }

    fn take_failure(&mut self) -> Option<SyncError> {
        (!self.failures.is_empty()).then(|| self.failures.remove(0))
    }

    fn apply(&mut self, change: Change) -> PushOutcome {
        let key = (change.kind, change.id);
        let is_delete = change.is_delete();
        let existing = self.rows.get(&key).cloned();

        if let Some(row) = &existing {
            let replay = if is_delete {
                row.is_deleted()
            } else {
                row.version == change.version && row.data == change.data && !row.is_deleted()
            };
            if replay {
                return PushOutcome::Applied(Applied {
                    version: row.version,
                    updated_at: row.updated_at,
                });
            }
            if change.expected_version != Some(row.version) {
                return PushOutcome::VersionConflict { current: existing };
            }
        } else if is_delete {
            // Deleting something the server never stored is a no-op
            return PushOutcome::Applied(Applied {
                version: change.version,
                updated_at: self.clock,
            });
        }

        let updated_at = self.tick();
        let row = RemoteRow {
            kind: change.kind,
            id: change.id,
            user_id: change.user_id,
            data: if is_delete {
                existing.and_then(|row| row.data)
            } else {
                change.data
            },
            version: change.version,
            updated_at,
            deleted_at: is_delete.then_some(updated_at),
        };
        self.rows.insert(key, row);

        PushOutcome::Applied(Applied {
            version: change.version,
            updated_at,
        })
    }
}

/// Remote data source held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
    offline: AtomicBool,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `NotConnected` until reset
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next call with `error`
    pub async fn fail_next(&self, error: SyncError) {
        self.state.lock().await.failures.push(error);
    }

    /// Delay every call by `latency`
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Server row for an entity, tombstones included
    pub async fn row(&self, kind: EntityKind, id: &EntityId) -> Option<RemoteRow> {
        self.state.lock().await.rows.get(&(kind, *id)).cloned()
    }

    /// Number of live rows of a kind
    pub async fn live_count(&self, kind: EntityKind) -> usize {
        self.state
            .lock()
            .await
            .rows
            .values()
            .filter(|row| row.kind == kind && !row.is_deleted())
            .count()
    }

    /// Simulate a write made by another device: bumps the server version
    pub async fn server_edit(
        &self,
        user_id: &str,
        id: EntityId,
        data: EntityPayload,
    ) -> RemoteRow {
        let mut state = self.state.lock().await;
        let kind = data.kind();
        let version = state.rows.get(&(kind, id)).map_or(1, |row| row.version + 1);
        let updated_at = state.tick();
        let row = RemoteRow {
            kind,
            id,
            user_id: user_id.to_string(),
            data: Some(data),
            version,
            updated_at,
            deleted_at: None,
        };
        state.rows.insert((kind, id), row.clone());
        row
    }

    /// Simulate a deletion made by another device
    pub async fn server_delete(&self, kind: EntityKind, id: &EntityId) -> Option<RemoteRow> {
        let mut state = self.state.lock().await;
        let updated_at = state.tick();
        let row = state.rows.get_mut(&(kind, *id))?;
        row.version += 1;
        row.updated_at = updated_at;
        row.deleted_at = Some(updated_at);
        Some(row.clone())
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Common prelude of every call: connectivity, injected failure, latency
    async fn begin_call(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }

        let latency = {
            let mut state = self.state.lock().await;
            if let Some(error) = state.take_failure() {
                return Err(error);
            }
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteDataSource for MemoryRemote {
    async fn pull(
        &self,
        kind: EntityKind,
        user_id: &str,
        since: Option<i64>,
    ) -> SyncResult<Vec<RemoteRow>> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.begin_call().await?;

        let state = self.state.lock().await;
        let mut rows: Vec<RemoteRow> = state
            .rows
            .values()
            .filter(|row| row.kind == kind && row.user_id == user_id)
            .filter(|row| since.map_or(true, |since| row.updated_at > since))
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.updated_at, row.id));
        Ok(rows)
    }

    async fn push_batch(&self, changes: Vec<Change>) -> SyncResult<BatchResult> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.begin_call().await?;

        let mut state = self.state.lock().await;
        let mut result = BatchResult::default();
        for change in changes {
            let id = change.id;
            if !change.is_delete() && change.data.is_none() {
                result
                    .rejected
                    .push((id, RejectReason::Invalid("missing entity data".to_string())));
                continue;
            }
            match state.apply(change) {
                PushOutcome::Applied(applied) => result.accepted.push((id, applied)),
                PushOutcome::VersionConflict { current } => result
                    .rejected
                    .push((id, RejectReason::VersionConflict { current })),
            }
        }
        Ok(result)
    }

    async fn push_one(&self, change: Change) -> SyncResult<PushOutcome> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        self.begin_call().await?;

        if !change.is_delete() && change.data.is_none() {
            return Err(SyncError::Rejected("missing entity data".to_string()));
        }
        Ok(self.state.lock().await.apply(change))
    }
}
