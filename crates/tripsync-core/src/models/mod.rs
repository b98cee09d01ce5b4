//! Data models for tripsync

mod entity;
mod operation;
mod sync_conflict;
mod sync_metadata;
mod trip;
mod vehicle;
mod work_schedule;

pub use entity::{
    ConflictSnapshot, EntityId, EntityKind, EntityPayload, SyncEntity, SyncMeta, SyncStatus,
    SyncedRecord,
};
pub use operation::{
    OperationAction, OperationId, OperationPayload, OperationStatus, PendingOperation,
    PRIORITY_EXPEDITED, PRIORITY_NORMAL,
};
pub use sync_conflict::{ConflictResolution, SyncConflict};
pub use sync_metadata::SyncMetadata;
pub use trip::Trip;
pub use vehicle::{FuelType, Vehicle};
pub use work_schedule::WorkSchedule;
