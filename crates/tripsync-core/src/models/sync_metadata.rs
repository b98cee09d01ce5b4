//! Per-entity-kind sync bookkeeping

use serde::{Deserialize, Serialize};

use super::EntityKind;

/// Watermarks and counters for one entity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub entity_kind: EntityKind,
    /// Delta watermark (server time, Unix ms)
    pub last_sync_timestamp: Option<i64>,
    /// Last cycle that pulled without a watermark
    pub last_full_sync_timestamp: Option<i64>,
    /// Mutual-exclusion flag; never set for longer than one cycle
    pub sync_in_progress: bool,
    /// Records pushed or pulled since install
    pub total_synced: i64,
    pub last_sync_error: Option<String>,
}

impl SyncMetadata {
    pub const fn new(entity_kind: EntityKind) -> Self {
        Self {
            entity_kind,
            last_sync_timestamp: None,
            last_full_sync_timestamp: None,
            sync_in_progress: false,
            total_synced: 0,
            last_sync_error: None,
        }
    }

    /// A cycle without a watermark pulls everything
    pub const fn needs_full_sync(&self) -> bool {
        self.last_sync_timestamp.is_none()
    }
}
