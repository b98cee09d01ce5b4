//! One sync cycle: push queued operations, push remaining dirty records,
//! pull server deltas, then update per-kind metadata.
//!
//! Cycles are serialized twice over: an in-process flag rejects concurrent
//! callers, and the persisted `sync_in_progress` flags are claimed before any
//! I/O and released on every exit path, including a cycle future that is
//! dropped before it completes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::{SyncError, SyncResult};
use super::remote::{
    AuthProvider, Change, ConnectivityReceiver, PushOutcome, RejectReason, RemoteDataSource,
    RemoteRow,
};
use crate::config::SyncConfig;
use crate::db::StoredEntity;
use crate::models::{
    ConflictSnapshot, EntityId, EntityKind, OperationPayload, PendingOperation, SyncStatus,
    PRIORITY_NORMAL,
};
use crate::services::{LocalStore, MergeOutcome, PendingOperationQueue, SyncMetadataStore};
use crate::util::now_ms;

/// Coarse state of the orchestrator, observable by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Running,
}

/// Why a cycle did not start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
    Unauthenticated,
}

/// Terminal state of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    /// The cycle completed but some operations or kinds failed
    PartialFailure,
    Failure(String),
    Skipped(SkipReason),
    Cancelled,
}

/// Summary of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    /// Local changes acknowledged by the server
    pub pushed: usize,
    /// Server rows written locally
    pub pulled: usize,
    /// Conflicts detected, whether parked or auto-resolved
    pub conflicts: usize,
    /// Operations or kinds that failed this cycle
    pub failed: usize,
    pub duration: Duration,
}

impl SyncReport {
    const fn empty(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            pushed: 0,
            pulled: 0,
            conflicts: 0,
            failed: 0,
            duration: Duration::ZERO,
        }
    }

    pub const fn succeeded(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Success)
    }
}

#[derive(Debug, Default)]
struct CycleStats {
    pushed: usize,
    pulled: usize,
    conflicts: usize,
    failed: usize,
    /// Pull results, committed to metadata when the cycle ends
    kinds: Vec<(EntityKind, KindResult)>,
}

impl CycleStats {
    fn count_merge(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied => self.pulled += 1,
            MergeOutcome::Conflict | MergeOutcome::Resolved(_) => self.conflicts += 1,
            MergeOutcome::Unchanged | MergeOutcome::Ignored => {}
        }
    }
}

#[derive(Debug)]
enum KindResult {
    Pulled {
        watermark: Option<i64>,
        full_sync: bool,
        synced: i64,
    },
    Failed(String),
}

/// Clears the in-process running flag when the cycle ends, however it ends
struct RunningGuard<'a> {
    flag: &'a AtomicBool,
    phase: &'a watch::Sender<SyncPhase>,
}

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool, phase: &'a watch::Sender<SyncPhase>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        phase.send_replace(SyncPhase::Running);
        Some(Self { flag, phase })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        self.phase.send_replace(SyncPhase::Idle);
    }
}

/// Persisted `sync_in_progress` flags held by one cycle.
///
/// Released explicitly when the cycle ends. If the cycle future is dropped
/// first (task abort, an outer timeout), the release is spawned on the
/// current runtime; without one, the flags are reset on the next start.
struct PersistedClaim {
    metadata: SyncMetadataStore,
    kinds: Vec<EntityKind>,
}

impl PersistedClaim {
    fn new(metadata: SyncMetadataStore) -> Self {
        Self {
            metadata,
            kinds: Vec::with_capacity(EntityKind::ALL.len()),
        }
    }

    async fn release(&mut self) {
        let kinds = std::mem::take(&mut self.kinds);
        release_kinds(&self.metadata, &kinds).await;
    }
}

impl Drop for PersistedClaim {
    fn drop(&mut self) {
        if self.kinds.is_empty() {
            return;
        }
        let kinds = std::mem::take(&mut self.kinds);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    "Sync cycle dropped while holding {} sync flags; releasing",
                    kinds.len()
                );
                let metadata = self.metadata.clone();
                handle.spawn(async move { release_kinds(&metadata, &kinds).await });
            }
            Err(_) => {
                tracing::warn!("Sync cycle dropped outside a runtime; flags reset on next start");
            }
        }
    }
}

async fn release_kinds(metadata: &SyncMetadataStore, kinds: &[EntityKind]) {
    for kind in kinds {
        if let Err(e) = metadata.clear_in_progress(*kind).await {
            tracing::error!("Failed to clear sync flag for {kind}: {e}");
        }
    }
}

/// Drives sync cycles against a remote data source
pub struct SyncOrchestrator {
    store: LocalStore,
    queue: PendingOperationQueue,
    metadata: SyncMetadataStore,
    remote: Arc<dyn RemoteDataSource>,
    auth: Arc<dyn AuthProvider>,
    connectivity: ConnectivityReceiver,
    config: SyncConfig,
    running: AtomicBool,
    phase: watch::Sender<SyncPhase>,
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        queue: PendingOperationQueue,
        metadata: SyncMetadataStore,
        remote: Arc<dyn RemoteDataSource>,
        auth: Arc<dyn AuthProvider>,
        connectivity: ConnectivityReceiver,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            queue,
            metadata,
            remote,
            auth,
            connectivity,
            config,
            running: AtomicBool::new(false),
            phase: watch::Sender::new(SyncPhase::Idle),
        }
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Queued operations still eligible for delivery; 0 if unreadable
    pub async fn pending_operations(&self) -> usize {
        self.queue.pending_count().await.unwrap_or_else(|e| {
            tracing::warn!("Failed to count pending operations: {e}");
            0
        })
    }

    /// Run one cycle. Never fails: every error is folded into the report and
    /// into queue and metadata state.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> SyncReport {
        let Some(_guard) = RunningGuard::acquire(&self.running, &self.phase) else {
            tracing::debug!("Sync already running; skipping");
            return SyncReport::empty(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
        };
        if !self.is_connected() {
            tracing::debug!("Offline; skipping sync");
            return SyncReport::empty(SyncOutcome::Skipped(SkipReason::Offline));
        }
        let Some(user_id) = self.auth.current_user_id() else {
            tracing::debug!("No signed-in user; skipping sync");
            return SyncReport::empty(SyncOutcome::Skipped(SkipReason::Unauthenticated));
        };

        let started = Instant::now();
        let mut claim = PersistedClaim::new(self.metadata.clone());
        match self.claim_kinds(&mut claim).await {
            Ok(true) => {}
            Ok(false) => {
                claim.release().await;
                return SyncReport::empty(SyncOutcome::Skipped(SkipReason::AlreadyRunning));
            }
            Err(e) => {
                tracing::error!("Failed to claim sync metadata: {e}");
                claim.release().await;
                return SyncReport::empty(SyncOutcome::Failure(e.to_string()));
            }
        }

        tracing::info!("Sync cycle started for user {user_id}");
        let mut stats = CycleStats::default();
        let result = self.run_phases(&user_id, cancel, &mut stats).await;
        let outcome = self.finish(&claim.kinds, result, &mut stats).await;
        claim.release().await;

        let report = SyncReport {
            outcome,
            pushed: stats.pushed,
            pulled: stats.pulled,
            conflicts: stats.conflicts,
            failed: stats.failed,
            duration: started.elapsed(),
        };
        tracing::info!(
            "Sync cycle finished: {:?} ({} pushed, {} pulled, {} conflicts, {} failed) in {:?}",
            report.outcome,
            report.pushed,
            report.pulled,
            report.conflicts,
            report.failed,
            report.duration
        );
        report
    }

    /// Set the persisted flag on every kind, recording each one in `claim`
    /// as it is taken; `false` if any kind is already held
    async fn claim_kinds(&self, claim: &mut PersistedClaim) -> crate::Result<bool> {
        for kind in EntityKind::ALL {
            if !self.metadata.mark_in_progress(kind).await? {
                tracing::warn!("{kind} is already marked as syncing; skipping cycle");
                return Ok(false);
            }
            claim.kinds.push(kind);
        }
        Ok(true)
    }

    async fn run_phases(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> SyncResult<()> {
        self.drain_queue(user_id, cancel, stats).await?;
        self.push_dirty(user_id, cancel, stats).await?;
        self.pull_all(user_id, cancel, stats).await
    }

    /// Commit metadata for the claimed kinds, then map the phase result
    async fn finish(
        &self,
        claimed: &[EntityKind],
        result: SyncResult<()>,
        stats: &mut CycleStats,
    ) -> SyncOutcome {
        let abort = match &result {
            Ok(()) | Err(SyncError::Cancelled | SyncError::Unauthenticated) => None,
            Err(e) => Some(e.to_string()),
        };

        for (kind, kind_result) in std::mem::take(&mut stats.kinds) {
            let recorded = match kind_result {
                KindResult::Pulled {
                    watermark,
                    full_sync,
                    synced,
                } => {
                    self.metadata
                        .record_success(kind, watermark, full_sync, synced)
                        .await
                }
                KindResult::Failed(error) => self.metadata.record_failure(kind, &error).await,
            };
            if let Err(e) = recorded {
                tracing::error!("Failed to record sync metadata for {kind}: {e}");
            }
        }
        if let Some(error) = &abort {
            for kind in claimed {
                if let Err(e) = self.metadata.record_failure(*kind, error).await {
                    tracing::error!("Failed to record sync error for {kind}: {e}");
                }
            }
        }

        match result {
            Ok(()) if stats.failed == 0 => SyncOutcome::Success,
            Ok(()) => SyncOutcome::PartialFailure,
            Err(SyncError::Cancelled) => {
                tracing::info!("Sync cycle cancelled");
                SyncOutcome::Cancelled
            }
            Err(SyncError::Unauthenticated) => {
                tracing::warn!("Session ended during sync; remaining work stays queued");
                SyncOutcome::Skipped(SkipReason::Unauthenticated)
            }
            Err(e) => {
                tracing::error!("Sync cycle failed: {e}");
                SyncOutcome::Failure(e.to_string())
            }
        }
    }

    /// Await a remote call under the request timeout and the cancel token
    async fn call<T>(
        &self,
        cancel: &CancellationToken,
        request: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(self.config.request_timeout(), request) => {
                result.unwrap_or(Err(SyncError::Timeout))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 1: queued operations
    // -----------------------------------------------------------------------

    async fn drain_queue(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> SyncResult<()> {
        let operations = self.queue.ready_for_retry(self.config.batch_size).await?;
        if !operations.is_empty() {
            tracing::debug!("Pushing {} queued operations", operations.len());
        }

        for operation in operations {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let change = Change::from_operation(&operation, user_id);
            match self.call(cancel, self.remote.push_one(change)).await {
                Ok(PushOutcome::Applied(applied)) => {
                    self.store
                        .acknowledge_push(&operation, applied.updated_at)
                        .await?;
                    stats.pushed += 1;
                }
                Ok(PushOutcome::VersionConflict { current }) => {
                    let outcome = self
                        .push_conflict(
                            Some(&operation),
                            user_id,
                            operation.entity_kind,
                            &operation.entity_id,
                            operation.payload.base_version,
                            current,
                        )
                        .await?;
                    stats.count_merge(outcome);
                }
                Err(e) => self.fail_operation(&operation, e, stats).await?,
            }
        }
        Ok(())
    }

    /// Record a failed delivery; aborts the cycle when continuing is pointless
    async fn fail_operation(
        &self,
        operation: &PendingOperation,
        error: SyncError,
        stats: &mut CycleStats,
    ) -> SyncResult<()> {
        if matches!(error, SyncError::Cancelled | SyncError::Unauthenticated) {
            return Err(error);
        }

        tracing::warn!(
            "Push of {} {} ({}) failed: {error}",
            operation.entity_kind,
            operation.entity_id,
            operation.action.as_str()
        );
        self.queue.record_failure(&operation.id, &error).await?;
        stats.failed += 1;

        if matches!(error, SyncError::NotConnected) {
            return Err(error);
        }
        Ok(())
    }

    async fn push_conflict(
        &self,
        operation: Option<&PendingOperation>,
        owner: &str,
        kind: EntityKind,
        id: &EntityId,
        expected_version: Option<i64>,
        current: Option<RemoteRow>,
    ) -> SyncResult<MergeOutcome> {
        let snapshot = current.map_or_else(
            || {
                // The server no longer holds the row at all
                let now = now_ms();
                ConflictSnapshot {
                    payload: None,
                    version: expected_version.unwrap_or(0) + 1,
                    updated_at: now,
                    deleted_at: Some(now),
                }
            },
            |row| row.to_snapshot(),
        );

        let outcome = self
            .store
            .resolve_push_conflict(
                operation.map(|operation| &operation.id),
                owner,
                kind,
                id,
                &snapshot,
                self.config.conflict_policy,
            )
            .await?;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Phase 2: dirty records not covered by the queue
    // -----------------------------------------------------------------------

    async fn push_dirty(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> SyncResult<()> {
        for kind in EntityKind::ALL {
            let mut dirty = Vec::new();
            for entity in self.store.list_needing_sync(kind).await? {
                if entity.sync.sync_status != SyncStatus::PendingUpload
                    || entity.sync.deleted_at.is_some()
                    || entity.user_id != user_id
                {
                    continue;
                }
                if self.queue.get_for_entity(kind, &entity.id).await?.is_none() {
                    dirty.push(entity);
                }
            }

            for chunk in dirty.chunks(self.config.batch_size.max(1)) {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                self.push_chunk(kind, chunk, cancel, stats).await?;
            }
        }
        Ok(())
    }

    async fn push_chunk(
        &self,
        kind: EntityKind,
        chunk: &[StoredEntity],
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> SyncResult<()> {
        tracing::debug!("Pushing {} unqueued {kind} records", chunk.len());
        let by_id: HashMap<EntityId, &StoredEntity> =
            chunk.iter().map(|entity| (entity.id, entity)).collect();
        let changes = chunk.iter().map(Change::from_entity).collect();

        let result = match self.call(cancel, self.remote.push_batch(changes)).await {
            Ok(result) => result,
            Err(e @ (SyncError::Cancelled | SyncError::Unauthenticated)) => return Err(e),
            Err(e) => {
                tracing::warn!("Batch push of {kind} failed: {e}");
                for entity in chunk {
                    self.queue_failed_entity(entity, &e).await?;
                }
                stats.failed += chunk.len();
                return match e {
                    SyncError::NotConnected => Err(e),
                    _ => Ok(()),
                };
            }
        };

        for (id, applied) in result.accepted {
            let Some(entity) = by_id.get(&id) else {
                continue;
            };
            self.store
                .mark_synced(kind, &id, entity.sync.version, applied.updated_at)
                .await?;
            stats.pushed += 1;
        }

        for (id, reason) in result.rejected {
            let Some(entity) = by_id.get(&id) else {
                continue;
            };
            match reason {
                RejectReason::VersionConflict { current } => {
                    let outcome = self
                        .push_conflict(
                            None,
                            &entity.user_id,
                            kind,
                            &id,
                            entity.sync.server_version,
                            current,
                        )
                        .await?;
                    stats.count_merge(outcome);
                }
                RejectReason::Invalid(message) => {
                    self.queue_failed_entity(entity, &SyncError::Rejected(message))
                        .await?;
                    stats.failed += 1;
                }
                RejectReason::Transient(message) => {
                    self.queue_failed_entity(entity, &SyncError::transport_retryable(message))
                        .await?;
                    stats.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Move a record that failed a batch push into the queue so it gets
    /// backoff and failure tracking from then on
    async fn queue_failed_entity(&self, entity: &StoredEntity, error: &SyncError) -> SyncResult<()> {
        let change = Change::from_entity(entity);
        let operation = self
            .queue
            .enqueue(
                entity.kind,
                &entity.id,
                change.action,
                OperationPayload {
                    version: entity.sync.version,
                    base_version: entity.sync.server_version,
                    data: change.data,
                },
                PRIORITY_NORMAL,
            )
            .await?;
        self.queue.record_failure(&operation.id, error).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase 3: server deltas
    // -----------------------------------------------------------------------

    async fn pull_all(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
        stats: &mut CycleStats,
    ) -> SyncResult<()> {
        for kind in EntityKind::ALL {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if self.config.is_export_only(kind) {
                stats.kinds.push((
                    kind,
                    KindResult::Pulled {
                        watermark: None,
                        full_sync: false,
                        synced: 0,
                    },
                ));
                continue;
            }

            let since = self
                .metadata
                .get(kind)
                .await?
                .and_then(|meta| meta.last_sync_timestamp);
            match self.call(cancel, self.remote.pull(kind, user_id, since)).await {
                Ok(rows) => {
                    let result = self.merge_rows(kind, since, rows, stats).await?;
                    stats.kinds.push((kind, result));
                }
                Err(e @ (SyncError::Cancelled | SyncError::Unauthenticated)) => return Err(e),
                Err(e) => {
                    tracing::warn!("Pull of {kind} failed: {e}");
                    stats.kinds.push((kind, KindResult::Failed(e.to_string())));
                    stats.failed += 1;
                    if matches!(e, SyncError::NotConnected) {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn merge_rows(
        &self,
        kind: EntityKind,
        since: Option<i64>,
        rows: Vec<RemoteRow>,
        stats: &mut CycleStats,
    ) -> SyncResult<KindResult> {
        let mut watermark: Option<i64> = None;
        let mut synced = 0;

        for row in rows {
            watermark = Some(watermark.map_or(row.updated_at, |w| w.max(row.updated_at)));
            // A queued local delete wins over a live server row
            if !row.is_deleted() && self.queue.has_pending_delete(kind, &row.id).await? {
                tracing::debug!("Skipping {kind} {}: delete pending", row.id);
                continue;
            }

            let outcome = self
                .store
                .merge_server_row(&row, self.config.conflict_policy)
                .await?;
            if outcome == MergeOutcome::Applied {
                synced += 1;
            }
            stats.count_merge(outcome);
        }

        Ok(KindResult::Pulled {
            watermark,
            full_sync: since.is_none(),
            synced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConflictPolicy, RetryConfig};
    use crate::db::Database;
    use crate::models::{SyncEntity, Trip, Vehicle, WorkSchedule};
    use crate::sync::{MemoryRemote, NetworkMonitor, SessionAuth};
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    struct Harness {
        store: LocalStore,
        queue: PendingOperationQueue,
        metadata: SyncMetadataStore,
        remote: Arc<MemoryRemote>,
        network: NetworkMonitor,
        orchestrator: SyncOrchestrator,
    }

    fn harness(config: SyncConfig) -> Harness {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let store = LocalStore::new(db.clone());
        let queue = PendingOperationQueue::new(db.clone(), RetryConfig::default());
        let metadata = SyncMetadataStore::new(db);
        let remote = Arc::new(MemoryRemote::new());
        let network = NetworkMonitor::new(true);
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            queue.clone(),
            metadata.clone(),
            remote.clone(),
            Arc::new(SessionAuth::new(Some("user-1".to_string()))),
            network.subscribe(),
            config,
        );
        Harness {
            store,
            queue,
            metadata,
            remote,
            network,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_create_is_pushed_and_acknowledged() {
        let h = harness(SyncConfig::default());
        let record = h.store.create("user-1", Vehicle::new("Clio")).await.unwrap();

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, SyncOutcome::Success);
        assert_eq!(report.pushed, 1);

        let synced = h.store.get::<Vehicle>(&record.id).await.unwrap().unwrap();
        assert_eq!(synced.sync.sync_status, SyncStatus::Synced);
        assert_eq!(synced.sync.server_version, Some(1));
        assert!(h.queue.list().await.unwrap().is_empty());
        assert!(h.remote.row(EntityKind::Vehicle, &record.id).await.is_some());
    }

    #[tokio::test]
    async fn test_skips_when_offline() {
        let h = harness(SyncConfig::default());
        h.network.set_connected(false);

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, SyncOutcome::Skipped(SkipReason::Offline));
        assert_eq!(h.remote.push_calls(), 0);
        assert!(!h.orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_skips_when_persisted_flag_is_held() {
        let h = harness(SyncConfig::default());
        h.metadata.mark_in_progress(EntityKind::Trip).await.unwrap();

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, SyncOutcome::Skipped(SkipReason::AlreadyRunning));

        // Only the flag we did not set survives
        let flags: Vec<_> = h
            .metadata
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|meta| meta.sync_in_progress)
            .map(|meta| meta.entity_kind)
            .collect();
        assert_eq!(flags, vec![EntityKind::Trip]);
    }

    #[tokio::test]
    async fn test_dropped_cycle_releases_persisted_flags() {
        let h = harness(SyncConfig::default());
        h.store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        h.remote.set_latency(Some(Duration::from_millis(500))).await;

        let token = CancellationToken::new();
        let cycle = h.orchestrator.run_cycle(&token);
        assert!(tokio::time::timeout(Duration::from_millis(50), cycle)
            .await
            .is_err());
        assert!(!h.orchestrator.is_running());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h
            .metadata
            .list()
            .await
            .unwrap()
            .iter()
            .all(|meta| !meta.sync_in_progress));

        h.remote.set_latency(None).await;
        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, SyncOutcome::Success);
        assert_eq!(report.pushed, 1);
    }

    #[tokio::test]
    async fn test_pull_applies_remote_rows_and_advances_watermark() {
        let h = harness(SyncConfig::default());
        let row = h
            .remote
            .server_edit("user-1", EntityId::new(), Trip::new(5_000).into_payload())
            .await;

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.pulled, 1);
        assert!(h.store.get::<Trip>(&row.id).await.unwrap().is_some());

        let meta = h.metadata.get(EntityKind::Trip).await.unwrap().unwrap();
        assert_eq!(meta.last_sync_timestamp, Some(row.updated_at));
        assert!(!meta.sync_in_progress);

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.pulled, 0);
    }

    #[tokio::test]
    async fn test_export_only_kinds_are_never_pulled() {
        let h = harness(SyncConfig::default());
        let row = h
            .remote
            .server_edit("user-1", EntityId::new(), WorkSchedule::new(1, 480, 1020).into_payload())
            .await;
        let local = h
            .store
            .create("user-1", WorkSchedule::new(2, 540, 1080))
            .await
            .unwrap();

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, SyncOutcome::Success);
        assert!(h.store.get::<WorkSchedule>(&row.id).await.unwrap().is_none());
        assert!(h.remote.row(EntityKind::WorkSchedule, &local.id).await.is_some());
    }

    #[tokio::test]
    async fn test_conflicting_push_parks_record() {
        let h = harness(SyncConfig::default());
        let record = h.store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        h.orchestrator.run_cycle(&CancellationToken::new()).await;

        h.remote
            .server_edit("user-1", record.id, Vehicle::new("Server").into_payload())
            .await;
        h.store.update(&record.id, Vehicle::new("Local")).await.unwrap();

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.conflicts, 1);

        let parked = h
            .store
            .get_entity(EntityKind::Vehicle, &record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parked.sync.sync_status, SyncStatus::Conflict);
        assert_eq!(
            Vehicle::from_payload(parked.data).unwrap().name,
            "Local".to_string()
        );
        assert_eq!(parked.conflict.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_prefer_local_republishes_local_fields() {
        let h = harness(SyncConfig {
            conflict_policy: ConflictPolicy::PreferLocal,
            ..SyncConfig::default()
        });
        let record = h.store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        h.orchestrator.run_cycle(&CancellationToken::new()).await;

        h.remote
            .server_edit("user-1", record.id, Vehicle::new("Server").into_payload())
            .await;
        h.store.update(&record.id, Vehicle::new("Local")).await.unwrap();

        h.orchestrator.run_cycle(&CancellationToken::new()).await;
        h.orchestrator.run_cycle(&CancellationToken::new()).await;

        let row = h.remote.row(EntityKind::Vehicle, &record.id).await.unwrap();
        assert_eq!(row.data, Some(Vehicle::new("Local").into_payload()));
        let local = h.store.get::<Vehicle>(&record.id).await.unwrap().unwrap();
        assert_eq!(local.sync.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_transient_failure_increments_retry() {
        let h = harness(SyncConfig::default());
        h.store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        h.remote.fail_next(SyncError::Server("503".into())).await;

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.outcome, SyncOutcome::PartialFailure);
        assert_eq!(report.failed, 1);

        let ops = h.queue.list().await.unwrap();
        assert_eq!(ops[0].retry_count, 1);
        assert!(ops[0].last_error.as_deref().unwrap_or_default().contains("503"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_queue_untouched() {
        let h = harness(SyncConfig::default());
        h.store.create("user-1", Vehicle::new("Clio")).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.orchestrator.run_cycle(&cancel).await;
        assert_eq!(report.outcome, SyncOutcome::Cancelled);

        let ops = h.queue.list().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].retry_count, 0);
        assert!(h
            .metadata
            .list()
            .await
            .unwrap()
            .iter()
            .all(|meta| !meta.sync_in_progress));
    }

    #[tokio::test]
    async fn test_pending_delete_is_not_resurrected() {
        let h = harness(SyncConfig::default());
        let record = h.store.create("user-1", Trip::new(0)).await.unwrap();
        h.orchestrator.run_cycle(&CancellationToken::new()).await;

        h.store.delete::<Trip>(&record.id).await.unwrap();
        h.remote.set_offline(true);
        h.orchestrator.run_cycle(&CancellationToken::new()).await;
        h.remote.set_offline(false);
        h.remote
            .server_edit("user-1", record.id, Trip::new(1).into_payload())
            .await;

        h.orchestrator.run_cycle(&CancellationToken::new()).await;
        assert!(h.store.get::<Trip>(&record.id).await.unwrap().is_none());
    }
}
