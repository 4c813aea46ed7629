use crate::error::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 1;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS scans (
            id              TEXT PRIMARY KEY,
            provider_ids    TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'running',
            started_at      TEXT NOT NULL,
            completed_at    TEXT,
            total_items     INTEGER DEFAULT 0,
            total_bytes     INTEGER DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS items (
            id              INTEGER PRIMARY KEY,
            scan_id         TEXT NOT NULL REFERENCES scans(id),
            path            TEXT NOT NULL,
            name            TEXT NOT NULL,
            extension       TEXT,
            provider_id     TEXT NOT NULL,
            size_bytes      INTEGER NOT NULL,
            mime_type       TEXT,
            created_at      TEXT,
            modified_at     TEXT,
            content_hash    TEXT,
            item_type       TEXT NOT NULL,
            depth           INTEGER NOT NULL,
            extended_properties TEXT,
            issues          TEXT,
            is_shared       BOOLEAN DEFAULT 0,
            UNIQUE(scan_id, path)
        );

        CREATE TABLE IF NOT EXISTS plans (
            id              TEXT PRIMARY KEY,
            scan_id         TEXT NOT NULL,
            is_what_if      BOOLEAN DEFAULT 0,
            state           TEXT NOT NULL DEFAULT 'draft',
            created_at      TEXT NOT NULL,
            total_files     INTEGER DEFAULT 0,
            total_size_bytes INTEGER DEFAULT 0,
            duplicates_eliminated INTEGER DEFAULT 0,
            depth_reduction REAL DEFAULT 0,
            compliance_uplift REAL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS operations (
            id              TEXT PRIMARY KEY,
            plan_id         TEXT NOT NULL REFERENCES plans(id),
            op_order        INTEGER NOT NULL,
            operation_type  TEXT NOT NULL,
            source_path     TEXT NOT NULL,
            source_provider TEXT NOT NULL,
            target_path     TEXT NOT NULL,
            target_provider TEXT NOT NULL,
            item_path       TEXT NOT NULL,
            rule_name       TEXT,
            status          TEXT NOT NULL DEFAULT 'pending',
            executed_at     TEXT,
            error           TEXT,
            correlation_id  TEXT NOT NULL,
            retry_count     INTEGER DEFAULT 0,
            hash_verified   BOOLEAN DEFAULT 0,
            size_bytes      INTEGER DEFAULT 0,
            is_file         BOOLEAN DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
            id              INTEGER PRIMARY KEY,
            plan_id         TEXT NOT NULL REFERENCES plans(id),
            batch_index     INTEGER NOT NULL,
            operations_done INTEGER NOT NULL,
            recorded_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id              INTEGER PRIMARY KEY,
            timestamp       TEXT NOT NULL,
            action          TEXT NOT NULL,
            plan_id         TEXT,
            operation_id    TEXT,
            details         TEXT
        );
        "#,
    )?;

    create_indexes(conn)?;
    set_schema_version(conn)?;

    Ok(())
}

fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_items_scan ON items(scan_id);
        CREATE INDEX IF NOT EXISTS idx_items_hash ON items(scan_id, content_hash, size_bytes);
        CREATE INDEX IF NOT EXISTS idx_items_name_size ON items(scan_id, name, size_bytes);
        CREATE INDEX IF NOT EXISTS idx_operations_plan ON operations(plan_id, op_order);
        CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status);
        CREATE INDEX IF NOT EXISTS idx_checkpoints_plan ON checkpoints(plan_id, batch_index);
        CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_log_plan ON audit_log(plan_id);
        "#,
    )?;
    Ok(())
}

fn set_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_version LIMIT 1")?;
    let mut rows = stmt.query([])?;

    if let Some(row) = rows.next()? {
        Ok(Some(row.get(0)?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initialization() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, Some(SCHEMA_VERSION));

        let table_count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(table_count, 7);
    }

    #[test]
    fn test_initialization_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        let index_count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(index_count, 8);
    }
}
