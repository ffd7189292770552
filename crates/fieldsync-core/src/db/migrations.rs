//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        apply(conn, 2, MIGRATION_V2)?;
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

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Apply one migration script atomically and record its version.
fn apply(conn: &Connection, version: i32, script: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(script)?;
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version} (target {CURRENT_VERSION})");
    Ok(())
}

/// Version 1: survey schema cache, collected data, and local values.
///
/// No `ON DELETE CASCADE`: removals are explicit ordered deletes so that a
/// survey is always replaced or removed inside one transaction.
const MIGRATION_V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS survey (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        last_modified INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS job (
        id TEXT PRIMARY KEY,
        survey_id TEXT NOT NULL REFERENCES survey(id),
        name TEXT NOT NULL,
        style_color TEXT,
        strategy TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_job_survey ON job(survey_id);

    CREATE TABLE IF NOT EXISTS task (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES job(id),
        idx INTEGER NOT NULL,
        task_type TEXT NOT NULL,
        label TEXT NOT NULL,
        is_required INTEGER NOT NULL,
        is_add_loi_task INTEGER NOT NULL DEFAULT 0,
        cardinality TEXT,
        has_other INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_task_job ON task(job_id);

    CREATE TABLE IF NOT EXISTS task_option (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL REFERENCES task(id),
        idx INTEGER NOT NULL,
        code TEXT NOT NULL,
        label TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_task_option_task ON task_option(task_id);

    CREATE TABLE IF NOT EXISTS condition (
        task_id TEXT PRIMARY KEY REFERENCES task(id),
        match_type TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS expression (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        condition_task_id TEXT NOT NULL REFERENCES condition(task_id),
        position INTEGER NOT NULL,
        expression_type TEXT NOT NULL,
        task_id TEXT NOT NULL,
        option_ids TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_expression_condition ON expression(condition_task_id);

    CREATE TABLE IF NOT EXISTS location_of_interest (
        id TEXT PRIMARY KEY,
        survey_id TEXT NOT NULL,
        job_id TEXT NOT NULL,
        custom_id TEXT,
        geometry TEXT NOT NULL,
        properties TEXT NOT NULL,
        is_predefined INTEGER NOT NULL,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        modified_by TEXT NOT NULL,
        modified_at INTEGER NOT NULL,
        server_modified_at INTEGER,
        is_deleted INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_loi_survey ON location_of_interest(survey_id);

    CREATE TABLE IF NOT EXISTS submission (
        id TEXT PRIMARY KEY,
        survey_id TEXT NOT NULL,
        loi_id TEXT NOT NULL,
        job_id TEXT NOT NULL,
        task_values TEXT NOT NULL,
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        modified_by TEXT NOT NULL,
        modified_at INTEGER NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_submission_loi ON submission(loi_id);

    CREATE TABLE IF NOT EXISTS local_values (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

/// Version 2: durable mutation queue.
const MIGRATION_V2: &str = "
    CREATE TABLE IF NOT EXISTS mutation_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        type TEXT NOT NULL,
        sync_status TEXT NOT NULL,
        survey_id TEXT NOT NULL,
        loi_id TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        job_id TEXT,
        parent_id INTEGER,
        user_id TEXT NOT NULL,
        client_timestamp INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        next_attempt_at INTEGER,
        updated_at INTEGER NOT NULL,
        payload TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_mutation_status ON mutation_queue(sync_status);
    CREATE INDEX IF NOT EXISTS idx_mutation_loi ON mutation_queue(loi_id);
    CREATE INDEX IF NOT EXISTS idx_mutation_entity ON mutation_queue(entity_id);
    CREATE INDEX IF NOT EXISTS idx_mutation_parent ON mutation_queue(parent_id);
";

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migration_v2_creates_mutation_queue() {
        let conn = setup();
        run(&conn).unwrap();

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM sqlite_master
                    WHERE type = 'table' AND name = 'mutation_queue'
                )",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert!(exists);
    }
}
