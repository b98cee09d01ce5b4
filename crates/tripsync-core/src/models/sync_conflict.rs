//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{EntityId, EntityKind};
use crate::error::{Error, Result};

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepLocal,
    KeepServer,
}

impl ConflictResolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepServer => "keep_server",
        }
    }
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keep_local" => Ok(Self::KeepLocal),
            "keep_server" => Ok(Self::KeepServer),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict resolution '{other}'"
            ))),
        }
    }
}

/// Logged sync conflict, open until `resolved_at` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    /// Local version frozen at detection
    pub local_version: i64,
    /// Server version that diverged
    pub server_version: i64,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
    /// Resolution timestamp (unix ms)
    pub resolved_at: Option<i64>,
    pub resolution: Option<ConflictResolution>,
}

impl SyncConflict {
    pub const fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
