//! Three-way classification of server rows against local state.
//!
//! No field-level merge is attempted: either one side's row is kept whole, or
//! the record is parked in `CONFLICT` with the server snapshot until a user
//! or an automated [`ConflictPolicy`](crate::config::ConflictPolicy) picks a
//! side.

use super::remote::RemoteRow;
use crate::db::StoredEntity;
use crate::models::SyncStatus;

/// What to do with one pulled server row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Server is not ahead of the last synced version; nothing to apply
    ServerUnchanged,
    /// Local has no pending delta (or holds the same write); adopt the row
    AcceptServer,
    /// Server row is a tombstone for something never stored locally
    IgnoreTombstone,
    /// Both sides changed since the last common version
    Conflict,
    /// Record already parked in `CONFLICT`; refresh the parked snapshot
    RefreshConflict,
}

/// Classifies pulled rows against local state
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Classify `remote` against the local record, if one exists
    pub fn classify(local: Option<&StoredEntity>, remote: &RemoteRow) -> Classification {
        let Some(local) = local else {
            return if remote.is_deleted() {
                Classification::IgnoreTombstone
            } else {
                Classification::AcceptServer
            };
        };

        if local.sync.sync_status == SyncStatus::Conflict {
            let parked = local.conflict.as_ref().map_or(0, |snapshot| snapshot.version);
            return if remote.version > parked {
                Classification::RefreshConflict
            } else {
                Classification::ServerUnchanged
            };
        }

        let last_synced = local.sync.server_version.unwrap_or(0);
        if remote.version <= last_synced {
            return Classification::ServerUnchanged;
        }

        match local.sync.sync_status {
            SyncStatus::Synced => Classification::AcceptServer,
            // Our own write, acknowledged without us hearing back
            _ if Self::is_echo(local, remote) => Classification::AcceptServer,
            _ => Classification::Conflict,
        }
    }

    fn is_echo(local: &StoredEntity, remote: &RemoteRow) -> bool {
        remote.version == local.sync.version
            && !remote.is_deleted()
            && remote.data.as_ref() == Some(&local.data)
    }
}
