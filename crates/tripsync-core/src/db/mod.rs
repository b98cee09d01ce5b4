//! Database layer for tripsync

mod connection;
mod conflict_repository;
mod entity_repository;
mod metadata_repository;
mod migrations;
mod operation_repository;

pub use connection::Database;
pub use conflict_repository::{ConflictRepository, SqliteConflictRepository};
pub use entity_repository::{EntityRepository, SqliteEntityRepository, StoredEntity};
pub use metadata_repository::{MetadataRepository, SqliteMetadataRepository};
pub use operation_repository::{OperationRepository, SqliteOperationRepository};
