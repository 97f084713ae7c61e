//! Database schema and migrations
//!
//! Embedded migrations applied in order, tracked with PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: durable log and correlation state
    r#"
    -- ============================================
    -- Durable log (append-only per session)
    -- ============================================

    CREATE TABLE IF NOT EXISTS records (
        session_id       TEXT NOT NULL,
        seq              INTEGER NOT NULL,
        kind             TEXT NOT NULL,
        natural_key      TEXT NOT NULL,
        payload          JSON NOT NULL,
        checksum         TEXT NOT NULL,
        created_at       DATETIME NOT NULL,
        synced           INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (session_id, seq)
    );

    CREATE INDEX IF NOT EXISTS idx_records_unsynced ON records(session_id, synced, seq);
    CREATE INDEX IF NOT EXISTS idx_records_key ON records(natural_key);

    -- ============================================
    -- Correlation and aggregation state
    -- ============================================

    CREATE TABLE IF NOT EXISTS pending_calls (
        call_id          TEXT PRIMARY KEY,
        session_id       TEXT NOT NULL,
        tool_name        TEXT NOT NULL,
        tool_use_id      TEXT,
        input            JSON NOT NULL,
        started_at       DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_pending_session ON pending_calls(session_id);
    CREATE INDEX IF NOT EXISTS idx_pending_started ON pending_calls(started_at);

    CREATE TABLE IF NOT EXISTS session_state (
        session_id       TEXT PRIMARY KEY,
        state            JSON NOT NULL,
        updated_at       DATETIME NOT NULL
    );
    "#,
    // Version 2: derived tables and projection cursors
    r#"
    CREATE TABLE IF NOT EXISTS file_accesses (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       TEXT NOT NULL,
        tool_key         TEXT NOT NULL,
        path             TEXT NOT NULL,
        access_mode      TEXT NOT NULL,
        is_primary       INTEGER NOT NULL,
        is_expansion     INTEGER NOT NULL,
        accessed_at      DATETIME
    );

    CREATE INDEX IF NOT EXISTS idx_file_accesses_session ON file_accesses(session_id);
    CREATE INDEX IF NOT EXISTS idx_file_accesses_path ON file_accesses(path);

    CREATE TABLE IF NOT EXISTS solutions (
        key              TEXT PRIMARY KEY,
        signature        TEXT NOT NULL,
        tool_sequence    JSON NOT NULL,
        successes        INTEGER NOT NULL DEFAULT 0,
        failures         INTEGER NOT NULL DEFAULT 0,
        first_seen       DATETIME NOT NULL,
        last_seen        DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_solutions_signature ON solutions(signature);

    CREATE TABLE IF NOT EXISTS sync_cursors (
        session_id       TEXT PRIMARY KEY,
        node_seq         INTEGER NOT NULL DEFAULT 0,
        edge_seq         INTEGER NOT NULL DEFAULT 0,
        updated_at       DATETIME NOT NULL
    );
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "records",
            "pending_calls",
            "session_state",
            "file_accesses",
            "solutions",
            "sync_cursors",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_upgrade_from_v1() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0]).unwrap();
        conn.execute("PRAGMA user_version = 1", []).unwrap();

        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }
}
