// Persistence layer: a single SQLite connection behind a tokio mutex,
// shared across the PRD/Story/Task/Learning operation sets (§4.1).

pub mod learnings;
pub mod prds;
pub mod schema;
pub mod stories;
pub mod tasks;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::AppResult;
use learnings::LearningOps;
use prds::PrdOps;
use stories::StoryOps;
use tasks::TaskOps;

/// Owns the connection and hands out scoped operation views onto it.
/// Mirrors the split the teacher's run database settled on: one shared
/// connection, one thin `Ops` struct per table rather than one struct
/// with every method on it.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(db_path: impl AsRef<Path>) -> AppResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        schema::initialize_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    pub fn in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn prds(&self) -> PrdOps<'_> {
        PrdOps::new(&self.conn)
    }

    pub fn stories(&self) -> StoryOps<'_> {
        StoryOps::new(&self.conn)
    }

    pub fn tasks(&self) -> TaskOps<'_> {
        TaskOps::new(&self.conn)
    }

    pub fn learnings(&self) -> LearningOps<'_> {
        LearningOps::new(&self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_roundtrip() {
        let db = Database::in_memory().unwrap();
        let prd = db.prds().create("u", "p", "title", "desc").await.unwrap();
        let fetched = db.prds().get(prd.id.unwrap()).await.unwrap();
        assert!(fetched.is_some());
    }
}
