//! Shared shape of every synchronized entity

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{Trip, Vehicle, WorkSchedule};
use crate::error::{Error, Result};

/// A client-generated, immutable entity identifier (UUID v7, time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Create a new unique entity ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The synchronized entity types, one local table each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Trip,
    Vehicle,
    WorkSchedule,
}

impl EntityKind {
    /// Every kind, in the order a sync cycle visits them.
    ///
    /// Vehicles come first so trips referencing a new vehicle never reach
    /// the server before it.
    pub const ALL: [Self; 3] = [Self::Vehicle, Self::WorkSchedule, Self::Trip];

    /// Stable name used in the queue, metadata rows and on the wire
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trip => "trip",
            Self::Vehicle => "vehicle",
            Self::WorkSchedule => "work_schedule",
        }
    }

    /// Local (and remote) table holding this kind
    pub const fn table(self) -> &'static str {
        match self {
            Self::Trip => "trips",
            Self::Vehicle => "vehicles",
            Self::WorkSchedule => "work_schedules",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trip" => Ok(Self::Trip),
            "vehicle" => Ok(Self::Vehicle),
            "work_schedule" => Ok(Self::WorkSchedule),
            other => Err(Error::InvalidInput(format!("unknown entity kind '{other}'"))),
        }
    }
}

/// Synchronization state of a local record.
///
/// `Conflict` is terminal until the record is explicitly resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Synced,
    PendingUpload,
    Conflict,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "SYNCED",
            Self::PendingUpload => "PENDING_UPLOAD",
            Self::Conflict => "CONFLICT",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SYNCED" => Ok(Self::Synced),
            "PENDING_UPLOAD" => Ok(Self::PendingUpload),
            "CONFLICT" => Ok(Self::Conflict),
            other => Err(Error::InvalidInput(format!("unknown sync status '{other}'"))),
        }
    }
}

/// Sync bookkeeping carried by every entity row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub sync_status: SyncStatus,
    /// Last local mutation (Unix ms)
    pub local_updated_at: i64,
    /// Last server timestamp observed; `None` until the first sync
    pub server_updated_at: Option<i64>,
    /// Incremented on every local mutation
    pub version: i64,
    /// Last version known to be stored on the server
    pub server_version: Option<i64>,
    /// Soft-delete marker
    pub deleted_at: Option<i64>,
}

impl SyncMeta {
    /// Metadata for a record created locally and not yet uploaded
    pub const fn new_local(now: i64) -> Self {
        Self {
            sync_status: SyncStatus::PendingUpload,
            local_updated_at: now,
            server_updated_at: None,
            version: 1,
            server_version: None,
            deleted_at: None,
        }
    }

    pub fn needs_sync(&self) -> bool {
        self.sync_status != SyncStatus::Synced
    }
}

/// A domain record together with its sync metadata
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedRecord<T> {
    pub id: EntityId,
    pub user_id: String,
    pub data: T,
    pub sync: SyncMeta,
}

/// Server-side snapshot parked on a record in `CONFLICT`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictSnapshot {
    /// Server fields; `None` when the server deleted the entity
    #[serde(default)]
    pub payload: Option<EntityPayload>,
    pub version: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

/// Implemented by every domain type the engine synchronizes.
pub trait SyncEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Wrap into the tagged payload union
    fn into_payload(self) -> EntityPayload;

    /// Unwrap from the tagged payload union; `None` on a kind mismatch
    fn from_payload(payload: EntityPayload) -> Option<Self>;

    /// Reject values that must never be stored
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Typed entity data, tagged by entity kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "data", rename_all = "snake_case")]
pub enum EntityPayload {
    Trip(Trip),
    Vehicle(Vehicle),
    WorkSchedule(WorkSchedule),
}

impl EntityPayload {
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Trip(_) => EntityKind::Trip,
            Self::Vehicle(_) => EntityKind::Vehicle,
            Self::WorkSchedule(_) => EntityKind::WorkSchedule,
        }
    }

    /// Serialize only the domain fields, as stored in the `data` column
    pub fn to_data_json(&self) -> Result<String> {
        let json = match self {
            Self::Trip(trip) => serde_json::to_string(trip)?,
            Self::Vehicle(vehicle) => serde_json::to_string(vehicle)?,
            Self::WorkSchedule(schedule) => serde_json::to_string(schedule)?,
        };
        Ok(json)
    }

    /// Same as [`Self::to_data_json`], as a JSON value
    pub fn to_data_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Trip(trip) => serde_json::to_value(trip)?,
            Self::Vehicle(vehicle) => serde_json::to_value(vehicle)?,
            Self::WorkSchedule(schedule) => serde_json::to_value(schedule)?,
        };
        Ok(value)
    }

    /// Parse the domain fields of a known kind
    pub fn from_data_json(kind: EntityKind, json: &str) -> Result<Self> {
        let payload = match kind {
            EntityKind::Trip => Self::Trip(serde_json::from_str(json)?),
            EntityKind::Vehicle => Self::Vehicle(serde_json::from_str(json)?),
            EntityKind::WorkSchedule => Self::WorkSchedule(serde_json::from_str(json)?),
        };
        Ok(payload)
    }

    /// Same as [`Self::from_data_json`], from an already parsed value
    pub fn from_data_value(kind: EntityKind, value: serde_json::Value) -> Result<Self> {
        let payload = match kind {
            EntityKind::Trip => Self::Trip(serde_json::from_value(value)?),
            EntityKind::Vehicle => Self::Vehicle(serde_json::from_value(value)?),
            EntityKind::WorkSchedule => Self::WorkSchedule(serde_json::from_value(value)?),
        };
        Ok(payload)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Trip(trip) => trip.validate(),
            Self::Vehicle(vehicle) => vehicle.validate(),
            Self::WorkSchedule(schedule) => schedule.validate(),
        }
    }
}
