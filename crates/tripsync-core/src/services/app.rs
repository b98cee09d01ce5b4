//! Process-wide application context.
//!
//! Owns the one database handle and every service built on it. Hosts create
//! it on app start and call [`AppContext::logout`] when the session ends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{LocalStore, PendingOperationQueue, SyncMetadataStore};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::sync::{
    AuthProvider, ConnectivityReceiver, HttpRemoteDataSource, RemoteDataSource, SchedulePolicy,
    SyncHandle, SyncOrchestrator, SyncReport, SyncResult, SyncScheduler,
};
use crate::{Error, Result};

/// Build the HTTP remote described by the configuration
pub fn remote_from_config(config: &EngineConfig) -> SyncResult<Arc<dyn RemoteDataSource>> {
    let remote = HttpRemoteDataSource::from_config(&config.remote, config.sync.request_timeout())?;
    Ok(Arc::new(remote))
}

/// Services shared by the whole process
pub struct AppContext {
    db_path: Option<PathBuf>,
    config: EngineConfig,
    store: LocalStore,
    queue: PendingOperationQueue,
    metadata: SyncMetadataStore,
    orchestrator: Arc<SyncOrchestrator>,
    connectivity: ConnectivityReceiver,
    scheduler: Mutex<Option<SyncHandle>>,
}

impl AppContext {
    /// Open the store and start periodic sync
    pub async fn start(
        config: EngineConfig,
        remote: Arc<dyn RemoteDataSource>,
        auth: Arc<dyn AuthProvider>,
        connectivity: ConnectivityReceiver,
    ) -> Result<Self> {
        let context = Self::open(config, remote, auth, connectivity).await?;
        context.start_periodic_sync().await;
        Ok(context)
    }

    /// Open the store at the configured path without starting the scheduler
    pub async fn open(
        config: EngineConfig,
        remote: Arc<dyn RemoteDataSource>,
        auth: Arc<dyn AuthProvider>,
        connectivity: ConnectivityReceiver,
    ) -> Result<Self> {
        let db_path = config.database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = open_with_recovery(&db_path)?;
        Self::from_database(db, Some(db_path), config, remote, auth, connectivity).await
    }

    /// Wrap an already opened database (in-memory for tests)
    pub async fn from_database(
        db: Database,
        db_path: Option<PathBuf>,
        config: EngineConfig,
        remote: Arc<dyn RemoteDataSource>,
        auth: Arc<dyn AuthProvider>,
        connectivity: ConnectivityReceiver,
    ) -> Result<Self> {
        let db = Arc::new(Mutex::new(db));
        let store = LocalStore::new(db.clone());
        let queue = PendingOperationQueue::new(db.clone(), config.retry.clone());
        let metadata = SyncMetadataStore::new(db);

        // A previous process may have died mid-cycle
        metadata.reset_stale_in_progress().await?;
        metadata.initialize_all().await?;

        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            queue.clone(),
            metadata.clone(),
            remote,
            auth,
            connectivity.clone(),
            config.sync.clone(),
        ));

        tracing::info!(
            "Sync engine ready ({})",
            db_path
                .as_deref()
                .map_or_else(|| "in-memory".to_string(), |path| path.display().to_string())
        );
        Ok(Self {
            db_path,
            config,
            store,
            queue,
            metadata,
            orchestrator,
            connectivity,
            scheduler: Mutex::new(None),
        })
    }

    pub const fn store(&self) -> &LocalStore {
        &self.store
    }

    pub const fn queue(&self) -> &PendingOperationQueue {
        &self.queue
    }

    pub const fn metadata(&self) -> &SyncMetadataStore {
        &self.metadata
    }

    pub fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Start the background loop; no-op if it is already running
    pub async fn start_periodic_sync(&self) {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.as_ref().is_some_and(SyncHandle::is_running) {
            return;
        }
        *scheduler = Some(SyncScheduler::start(
            self.orchestrator(),
            SchedulePolicy::from(&self.config.sync),
            self.connectivity.clone(),
        ));
    }

    /// Stop the background loop, cancelling a cycle in flight
    pub async fn stop_periodic_sync(&self) {
        let handle = self.scheduler.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Run a cycle now; goes through the scheduler when it is running
    pub async fn sync_now(&self) -> SyncReport {
        let handle = self.scheduler.lock().await.clone();
        if let Some(handle) = handle {
            if let Some(report) = handle.force_sync().await {
                return report;
            }
        }
        self.orchestrator.run_cycle(&CancellationToken::new()).await
    }

    /// End the session: stop syncing and flush every local cache and queue
    pub async fn logout(&self) -> Result<()> {
        self.stop_periodic_sync().await;

        self.store.clear_all().await?;
        let dropped = self.queue.clear().await?;
        self.metadata.clear().await?;
        self.metadata.initialize_all().await?;

        tracing::info!("Logged out; dropped {dropped} queued operations");
        Ok(())
    }
}

/// Open the database, moving an unreadable file aside and retrying once
fn open_with_recovery(db_path: &Path) -> Result<Database> {
    match Database::open(db_path) {
        Ok(db) => Ok(db),
        Err(error) if is_corrupted_db_error(&error) => {
            tracing::warn!(
                "Local store at {} is not a database: {error}. Moving it aside.",
                db_path.display()
            );
            quarantine_corrupted_db_files(db_path)?;
            Database::open(db_path)
        }
        Err(error) => Err(error),
    }
}

fn is_corrupted_db_error(error: &Error) -> bool {
    matches!(
        error,
        Error::Database(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == rusqlite::ErrorCode::NotADatabase
    )
}

fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
    let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
        return Ok(());
    };

    if db_path.exists() {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));
        std::fs::rename(db_path, &backup_path)?;
        tracing::warn!(
            "Moved corrupted local store from {} to {}",
            db_path.display(),
            backup_path.display()
        );
    }

    for suffix in ["-wal", "-shm"] {
        let sidecar = db_path.with_file_name(format!("{base_name}{suffix}"));
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)?;
            tracing::warn!("Removed stale sidecar {}", sidecar.display());
        }
    }
    Ok(())
}
