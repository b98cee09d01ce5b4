//! Collaborator interfaces consumed by the sync engine.
//!
//! The authoritative backend is reached through [`RemoteDataSource`]; the
//! signed-in user comes from an [`AuthProvider`]. Both are object-safe so the
//! application can inject real or in-process implementations.

use async_trait::async_trait;
use tokio::sync::watch;

use super::error::SyncResult;
use crate::db::StoredEntity;
use crate::models::{
    ConflictSnapshot, EntityId, EntityKind, EntityPayload, OperationAction, PendingOperation,
};

/// A row as held by the server
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    pub kind: EntityKind,
    pub id: EntityId,
    pub user_id: String,
    /// Domain fields; `None` for tombstones
    pub data: Option<EntityPayload>,
    /// Server-side version counter
    pub version: i64,
    /// Server timestamp of the last write (Unix ms)
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl RemoteRow {
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some() || self.data.is_none()
    }

    /// Snapshot parked on a local record when this row conflicts with it
    pub fn to_snapshot(&self) -> ConflictSnapshot {
        ConflictSnapshot {
            payload: self.data.clone(),
            version: self.version,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        }
    }
}

/// One mutation sent to the server
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: EntityKind,
    pub id: EntityId,
    pub user_id: String,
    pub action: OperationAction,
    /// Local version being published
    pub version: i64,
    /// Server version the change was made against; `None` for new entities
    pub expected_version: Option<i64>,
    /// Typed fields; `None` for deletes
    pub data: Option<EntityPayload>,
}

impl Change {
    /// Build the change for a queued operation
    pub fn from_operation(operation: &PendingOperation, user_id: &str) -> Self {
        Self {
            kind: operation.entity_kind,
            id: operation.entity_id,
            user_id: user_id.to_string(),
            action: operation.action,
            version: operation.payload.version,
            expected_version: operation.payload.base_version,
            data: match operation.action {
                OperationAction::Delete => None,
                _ => operation.payload.data.clone(),
            },
        }
    }

    /// Build an upsert for a dirty local record not covered by the queue
    pub fn from_entity(entity: &StoredEntity) -> Self {
        Self {
            kind: entity.kind,
            id: entity.id,
            user_id: entity.user_id.clone(),
            action: if entity.sync.server_version.is_some() {
                OperationAction::Update
            } else {
                OperationAction::Create
            },
            version: entity.sync.version,
            expected_version: entity.sync.server_version,
            data: Some(entity.data.clone()),
        }
    }

    pub const fn is_delete(&self) -> bool {
        matches!(self.action, OperationAction::Delete)
    }
}

/// Server acknowledgement of an applied change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub version: i64,
    pub updated_at: i64,
}

/// Result of a single version-checked write
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Applied(Applied),
    /// The server version no longer matches `expected_version`
    VersionConflict { current: Option<RemoteRow> },
}

/// Why a change in a batch was not applied
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    VersionConflict { current: Option<RemoteRow> },
    /// Refused permanently (validation, permissions)
    Invalid(String),
    /// Failed transiently; worth retrying
    Transient(String),
}

/// Per-change outcome of an atomic batch apply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub accepted: Vec<(EntityId, Applied)>,
    pub rejected: Vec<(EntityId, RejectReason)>,
}

/// The authoritative backend.
///
/// Writes must be idempotent: replaying a change the server already applied
/// (same id and version) acknowledges it again without modifying anything.
#[async_trait]
pub trait RemoteDataSource: Send + Sync {
    /// Rows of `kind` owned by `user_id` written after `since` (all when `None`)
    async fn pull(
        &self,
        kind: EntityKind,
        user_id: &str,
        since: Option<i64>,
    ) -> SyncResult<Vec<RemoteRow>>;

    /// Apply several changes in one call
    async fn push_batch(&self, changes: Vec<Change>) -> SyncResult<BatchResult>;

    /// Apply one change, checked against its expected version
    async fn push_one(&self, change: Change) -> SyncResult<PushOutcome>;
}

/// Source of the signed-in user
pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool {
        self.current_user_id().is_some()
    }

    fn current_user_id(&self) -> Option<String>;
}

/// Auth provider fed by the application's sign-in flow
#[derive(Debug)]
pub struct SessionAuth {
    user: watch::Sender<Option<String>>,
}

impl SessionAuth {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user: watch::Sender::new(user_id),
        }
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        self.user.send_replace(Some(user_id.into()));
    }

    pub fn sign_out(&self) {
        self.user.send_replace(None);
    }
}

impl AuthProvider for SessionAuth {
    fn current_user_id(&self) -> Option<String> {
        self.user.borrow().clone()
    }
}

/// Connectivity feed; `true` while the network is reachable
pub type ConnectivityReceiver = watch::Receiver<bool>;

/// Publisher side of the connectivity feed
#[derive(Debug)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(connected: bool) -> Self {
        Self {
            tx: watch::Sender::new(connected),
        }
    }

    pub fn subscribe(&self) -> ConnectivityReceiver {
        self.tx.subscribe()
    }

    /// Publish a connectivity change; repeated values are not re-broadcast
    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|current| {
            if *current == connected {
                false
            } else {
                *current = connected;
                true
            }
        });
    }

    pub fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        OperationId, OperationPayload, OperationStatus, SyncEntity, SyncMeta, Vehicle,
        PRIORITY_NORMAL,
    };
    use pretty_assertions::assert_eq;

    fn operation(action: OperationAction) -> PendingOperation {
        PendingOperation {
            id: OperationId::new(),
            entity_kind: EntityKind::Vehicle,
            entity_id: EntityId::new(),
            action,
            payload: OperationPayload {
                version: 3,
                base_version: Some(2),
                data: Some(Vehicle::new("Clio").into_payload()),
            },
            priority: PRIORITY_NORMAL,
            retry_count: 0,
            status: OperationStatus::Pending,
            last_attempt_at: None,
            last_error: None,
            created_at: 0,
        }
    }

    #[test]
    fn change_from_operation() {
        let op = operation(OperationAction::Update);
        let change = Change::from_operation(&op, "user-1");
        assert_eq!(change.version, 3);
        assert_eq!(change.expected_version, Some(2));
        assert_eq!(change.user_id, "user-1");
        assert!(change.data.is_some());

        let delete = Change::from_operation(&operation(OperationAction::Delete), "user-1");
        assert!(delete.is_delete());
        assert!(delete.data.is_none());
    }

    #[test]
    fn change_from_entity_picks_action() {
        let mut entity = StoredEntity {
            kind: EntityKind::Vehicle,
            id: EntityId::new(),
            user_id: "user-1".to_string(),
            data: Vehicle::new("Clio").into_payload(),
            sync: SyncMeta::new_local(0),
            conflict: None,
        };

        let change = Change::from_entity(&entity);
        assert_eq!(change.action, OperationAction::Create);
        assert!(change.expected_version.is_none());

        entity.sync.server_version = Some(1);
        entity.sync.version = 2;
        let change = Change::from_entity(&entity);
        assert_eq!(change.action, OperationAction::Update);
        assert_eq!(change.version, 2);
        assert_eq!(change.expected_version, Some(1));
    }

    #[test]
    fn session_auth_tracks_sign_in() {
        let auth = SessionAuth::new(None);
        assert!(!auth.is_authenticated());

        auth.sign_in("user-1");
        assert_eq!(auth.current_user_id().as_deref(), Some("user-1"));

        auth.sign_out();
        assert!(auth.current_user_id().is_none());
    }

    #[tokio::test]
    async fn network_monitor_publishes_changes() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();

        monitor.set_connected(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        monitor.set_connected(true);
        assert!(!rx.has_changed().unwrap());
    }
}
