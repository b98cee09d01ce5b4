//! tripsync-core - Core library for tripsync
//!
//! Offline-first storage and synchronization for vehicles, work schedules
//! and trips. Writes land in the local store and the durable operation queue
//! first; the sync engine pushes them to the backend and pulls server changes
//! back when the device is online.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use config::{ConflictPolicy, EngineConfig, RetryConfig, SyncConfig};
pub use error::{Error, Result};
pub use models::{EntityId, EntityKind, OperationId, SyncStatus, Trip, Vehicle, WorkSchedule};
pub use services::{AppContext, LocalStore, PendingOperationQueue, SyncMetadataStore};
pub use sync::{SyncError, SyncHandle, SyncOrchestrator, SyncOutcome, SyncReport};
