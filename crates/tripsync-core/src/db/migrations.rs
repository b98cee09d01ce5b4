//! Database migrations

use crate::error::Result;
use crate::models::EntityKind;
use rusqlite::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Apply statements atomically; the transaction rolls back on drop
fn apply(conn: &Connection, statements: &[String]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;
    Ok(())
}

/// Entity table: domain fields as JSON plus sync columns
fn entity_table_statements(kind: EntityKind) -> [String; 3] {
    let table = kind.table();
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                data TEXT NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'PENDING_UPLOAD',
                local_updated_at INTEGER NOT NULL,
                server_updated_at INTEGER,
                version INTEGER NOT NULL DEFAULT 1,
                server_version INTEGER,
                deleted_at INTEGER,
                conflict_data TEXT
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_sync_status ON {table}(sync_status)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_user ON {table}(user_id)"),
    ]
}

/// Migration to version 1: entity tables, operation queue, sync metadata
fn migrate_v1(conn: &Connection) -> Result<()> {
    let mut statements = vec!["CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )"
    .to_string()];

    for kind in EntityKind::ALL {
        statements.extend(entity_table_statements(kind));
    }

    statements.extend(
        [
            // seq keeps FIFO order stable when created_at collides
            "CREATE TABLE IF NOT EXISTS pending_operations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                retry_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'PENDING',
                last_attempt_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_pending_operations_entity
                ON pending_operations(entity_type, entity_id)",
            "CREATE INDEX IF NOT EXISTS idx_pending_operations_created
                ON pending_operations(created_at, seq)",
            "CREATE TABLE IF NOT EXISTS sync_metadata (
                entity_type TEXT PRIMARY KEY,
                last_sync_timestamp INTEGER,
                last_full_sync_timestamp INTEGER,
                sync_in_progress INTEGER NOT NULL DEFAULT 0,
                total_synced INTEGER NOT NULL DEFAULT 0,
                last_sync_error TEXT
            )",
            "INSERT INTO schema_version (version) VALUES (1)",
        ]
        .map(str::to_string),
    );

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict history
fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_version INTEGER NOT NULL,
            server_version INTEGER NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER,
            resolution TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(entity_type, entity_id)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at ON sync_conflicts(detected_at DESC)",
        "INSERT INTO schema_version (version) VALUES (2)",
    ]
    .map(str::to_string);

    apply(conn, &statements)?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
