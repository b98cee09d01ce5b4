//! Pending operation model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntityId, EntityKind, EntityPayload};
use crate::error::{Error, Result};

/// Priority of expedited operations (user-visible deletes, first uploads)
pub const PRIORITY_EXPEDITED: i32 = 1;

/// Priority of ordinary edits
pub const PRIORITY_NORMAL: i32 = 5;

/// A unique identifier for a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Mutation carried by a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationAction {
    Create,
    Update,
    Delete,
}

impl OperationAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// Action of an outstanding row after a later enqueue for the same entity.
    ///
    /// A delete always wins; a create stays a create since the server has
    /// never seen the entity.
    #[must_use]
    pub const fn coalesce(self, later: Self) -> Self {
        match (self, later) {
            (_, Self::Delete) => Self::Delete,
            (Self::Create, _) => Self::Create,
            (_, later) => later,
        }
    }
}

impl FromStr for OperationAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!(
                "unknown operation action '{other}'"
            ))),
        }
    }
}

/// Delivery state of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    /// Retry budget exhausted; waits for manual intervention or a reset
    Failed,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "FAILED" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown operation status '{other}'"
            ))),
        }
    }
}

/// Snapshot captured at enqueue time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    /// Local version at enqueue time
    pub version: i64,
    /// Server version the change was made against (optimistic lock)
    #[serde(default)]
    pub base_version: Option<i64>,
    /// Entity fields; absent for deletes
    #[serde(default)]
    pub data: Option<EntityPayload>,
}

/// A not-yet-acknowledged mutation
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: OperationId,
    pub entity_kind: EntityKind,
    pub entity_id: EntityId,
    pub action: OperationAction,
    pub payload: OperationPayload,
    pub priority: i32,
    pub retry_count: u32,
    pub status: OperationStatus,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationAction::{Create, Delete, Update};

    #[test]
    fn test_action_coalesce() {
        assert_eq!(Create.coalesce(Update), Create);
        assert_eq!(Create.coalesce(Delete), Delete);
        assert_eq!(Update.coalesce(Update), Update);
        assert_eq!(Update.coalesce(Delete), Delete);
        assert_eq!(Delete.coalesce(Update), Update);
    }

    #[test]
    fn test_action_names() {
        for action in [Create, Update, Delete] {
            assert_eq!(action.as_str().parse::<OperationAction>().unwrap(), action);
        }
    }

    #[test]
    fn test_payload_without_data() {
        let payload: OperationPayload = serde_json::from_str(r#"{"version": 3}"#).unwrap();
        assert_eq!(payload.version, 3);
        assert!(payload.base_version.is_none());
        assert!(payload.data.is_none());
    }
}
