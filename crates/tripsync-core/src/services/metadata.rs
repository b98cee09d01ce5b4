//! Per-kind sync bookkeeping service.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{Database, MetadataRepository, SqliteMetadataRepository};
use crate::models::{EntityKind, SyncMetadata};
use crate::Result;

/// Thread-safe service over the `sync_metadata` table.
#[derive(Clone)]
pub struct SyncMetadataStore {
    db: Arc<Mutex<Database>>,
}

impl SyncMetadataStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Create a row for every kind that lacks one
    pub async fn initialize_all(&self) -> Result<()> {
        let db = self.db.lock().await;
        let repo = SqliteMetadataRepository::new(db.connection());
        for kind in EntityKind::ALL {
            repo.initialize_if_not_exists(kind)?;
        }
        Ok(())
    }

    pub async fn get(&self, kind: EntityKind) -> Result<Option<SyncMetadata>> {
        let db = self.db.lock().await;
        SqliteMetadataRepository::new(db.connection()).get(kind)
    }

    pub async fn list(&self) -> Result<Vec<SyncMetadata>> {
        let db = self.db.lock().await;
        SqliteMetadataRepository::new(db.connection()).list()
    }

    /// Claim the kind for this cycle; false if another cycle holds it
    pub async fn mark_in_progress(&self, kind: EntityKind) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteMetadataRepository::new(db.connection()).mark_in_progress(kind)
    }

    pub async fn record_success(
        &self,
        kind: EntityKind,
        watermark: Option<i64>,
        full_sync: bool,
        synced: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        SqliteMetadataRepository::new(db.connection()).record_success(
            kind, watermark, full_sync, synced,
        )
    }

    pub async fn record_failure(&self, kind: EntityKind, error: &str) -> Result<()> {
        let db = self.db.lock().await;
        SqliteMetadataRepository::new(db.connection()).record_failure(kind, error)
    }

    pub async fn clear_in_progress(&self, kind: EntityKind) -> Result<()> {
        let db = self.db.lock().await;
        SqliteMetadataRepository::new(db.connection()).clear_in_progress(kind)
    }

    /// Release flags a crashed process left set
    pub async fn reset_stale_in_progress(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let reset = SqliteMetadataRepository::new(db.connection()).reset_stale_in_progress()?;
        if reset > 0 {
            tracing::warn!("Cleared {reset} stale sync-in-progress flags");
        }
        Ok(reset)
    }

    pub async fn clear(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteMetadataRepository::new(db.connection()).clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_initialize_all_kinds() {
        let db = Database::open_in_memory().unwrap();
        let store = SyncMetadataStore::new(Arc::new(Mutex::new(db)));

        store.initialize_all().await.unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), EntityKind::ALL.len());
        assert!(all.iter().all(SyncMetadata::needs_full_sync));
    }

    #[tokio::test]
    async fn test_stale_flags_cleared() {
        let db = Database::open_in_memory().unwrap();
        let store = SyncMetadataStore::new(Arc::new(Mutex::new(db)));

        assert!(store.mark_in_progress(EntityKind::Trip).await.unwrap());
        assert_eq!(store.reset_stale_in_progress().await.unwrap(), 1);
        assert!(store.mark_in_progress(EntityKind::Trip).await.unwrap());
    }
}
