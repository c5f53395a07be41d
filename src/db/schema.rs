// Database schema creation and migrations
//
// Handles SQLite table creation, index creation, and forward-only
// idempotent migrations gated by a version row (§4.1, §6.3).

use rusqlite::{Connection, Result as SqliteResult};

pub const SCHEMA_VERSION: i64 = 1;

pub fn create_prds_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS prds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            project_name TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            metadata TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_prds_owner ON prds(user_id, project_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_prds_status ON prds(status)",
        [],
    )?;
    Ok(())
}

pub fn create_stories_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS stories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            prd_id INTEGER NOT NULL,
            order_index INTEGER NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            acceptance_criteria TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (prd_id) REFERENCES prds(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stories_prd ON stories(prd_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stories_status ON stories(status)",
        [],
    )?;
    Ok(())
}

pub fn create_tasks_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            story_id INTEGER NOT NULL,
            order_index INTEGER NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 2,
            effort_level TEXT,
            task_type TEXT,
            depends_on TEXT,
            status TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error_message TEXT,
            agent_output TEXT,
            files_changed TEXT,
            quality_gate_result TEXT,
            verification_result TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (story_id) REFERENCES stories(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_story ON tasks(story_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority DESC, order_index ASC)",
        [],
    )?;
    Ok(())
}

pub fn create_learnings_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS learnings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            project_name TEXT,
            source_task_id INTEGER,
            category TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            relevance_keywords TEXT,
            usage_count INTEGER NOT NULL DEFAULT 0,
            confidence REAL NOT NULL DEFAULT 0.5,
            last_used TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_learnings_owner ON learnings(user_id, project_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_learnings_category ON learnings(category)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_learnings_active ON learnings(is_active)",
        [],
    )?;
    Ok(())
}

fn create_schema_migrations_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (id, version) VALUES (1, 0)",
        [],
    )?;
    Ok(())
}

fn current_version(conn: &Connection) -> SqliteResult<i64> {
    conn.query_row("SELECT version FROM schema_migrations WHERE id = 1", [], |row| {
        row.get(0)
    })
}

fn set_version(conn: &Connection, version: i64) -> SqliteResult<()> {
    conn.execute(
        "UPDATE schema_migrations SET version = ?1 WHERE id = 1",
        [version],
    )?;
    Ok(())
}

/// Run forward-only, idempotent migrations up to SCHEMA_VERSION.
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    create_schema_migrations_table(conn)?;
    let version = current_version(conn)?;

    if version < 1 {
        create_prds_table(conn)?;
        create_stories_table(conn)?;
        create_tasks_table(conn)?;
        create_learnings_table(conn)?;
        set_version(conn, 1)?;
    }

    Ok(())
}

/// Initialize all tables, indexes and migrations.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    run_migrations(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        let version: i64 = current_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn all_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        for table in ["prds", "stories", "tasks", "learnings"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
