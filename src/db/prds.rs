// CRUD operations for PRDs.

use rusqlite::{params, Connection, Result as SqliteResult};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db_utils::{columns, DatabaseOps, QueryBuilder};
use crate::models::{Prd, PrdStatus};

fn row_to_prd(row: &rusqlite::Row) -> SqliteResult<Prd> {
    let status_str: String = row.get(5)?;
    let id: i64 = row.get(0)?;
    Ok(Prd {
        id: Some(id),
        user_id: row.get(1)?,
        project_name: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status: PrdStatus::from_str(&status_str),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        completed_at: row.get(8)?,
        metadata: row.get(9)?,
        total_stories: 0,
        completed_stories: 0,
        failed_stories: 0,
    })
}

pub struct PrdOps<'a> {
    db: &'a Arc<Mutex<Connection>>,
}

impl<'a> PrdOps<'a> {
    pub fn new(db: &'a Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        user_id: &str,
        project_name: &str,
        title: &str,
        description: &str,
    ) -> SqliteResult<Prd> {
        let user_id = user_id.to_string();
        let project_name = project_name.to_string();
        let title = title.to_string();
        let description = description.to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let id = self
            .db
            .with_db(move |db| {
                db.execute(
                    "INSERT INTO prds (user_id, project_name, title, description, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![user_id, project_name, title, description, PrdStatus::Draft.as_str(), now],
                )?;
                Ok(db.last_insert_rowid())
            })
            .await?;

        Ok(self.get(id).await?.expect("row just inserted"))
    }

    pub async fn get(&self, id: i64) -> SqliteResult<Option<Prd>> {
        self.db
            .with_db(move |db| {
                let query = format!("SELECT {} FROM prds WHERE id = ?1", columns::PRDS);
                let mut stmt = db.prepare(&query)?;
                let mut rows = stmt.query(params![id])?;
                if let Some(row) = rows.next()? {
                    let mut prd = row_to_prd(row)?;
                    let (total, completed, failed) = story_counts(db, id)?;
                    prd.total_stories = total;
                    prd.completed_stories = completed;
                    prd.failed_stories = failed;
                    Ok(Some(prd))
                } else {
                    Ok(None)
                }
            })
            .await
    }

    pub async fn list(&self, user_id: &str, project_name: Option<&str>) -> SqliteResult<Vec<Prd>> {
        let user_id = user_id.to_string();
        let project_name = project_name.map(|s| s.to_string());

        self.db
            .with_db(move |db| {
                let base_query = format!("SELECT {} FROM prds WHERE 1=1", columns::PRDS);
                let mut builder = QueryBuilder::new(&base_query);
                builder.add_condition("user_id = ?", user_id);
                if let Some(project_name) = project_name {
                    builder.add_condition("project_name = ?", project_name);
                }
                builder.add_order_by("created_at DESC");

                let (query, query_params) = builder.build();
                let mut stmt = db.prepare(&query)?;
                let param_refs = QueryBuilder::params_as_refs(&query_params);

                let prds = stmt.query_map(param_refs.as_slice(), row_to_prd)?;
                let mut result = Vec::new();
                for prd in prds {
                    let mut prd = prd?;
                    let id = prd.id.expect("persisted prd has id");
                    let (total, completed, failed) = story_counts(db, id)?;
                    prd.total_stories = total;
                    prd.completed_stories = completed;
                    prd.failed_stories = failed;
                    result.push(prd);
                }
                Ok(result)
            })
            .await
    }

    pub async fn update_status(&self, id: i64, status: PrdStatus) -> SqliteResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .with_db(move |db| {
                if status == PrdStatus::Completed {
                    db.execute(
                        "UPDATE prds SET status = ?2, updated_at = ?3, completed_at = ?3 WHERE id = ?1",
                        params![id, status.as_str(), now],
                    )?;
                } else {
                    db.execute(
                        "UPDATE prds SET status = ?2, updated_at = ?3 WHERE id = ?1",
                        params![id, status.as_str(), now],
                    )?;
                }
                Ok(())
            })
            .await
    }
}

/// Aggregate child story counts for a PRD, computed in the same query
/// family as the row fetch (§4.1 "derived counts").
fn story_counts(db: &Connection, prd_id: i64) -> SqliteResult<(i64, i64, i64)> {
    let total: i64 = db.query_row(
        "SELECT COUNT(*) FROM stories WHERE prd_id = ?1",
        params![prd_id],
        |row| row.get(0),
    )?;
    let completed: i64 = db.query_row(
        "SELECT COUNT(*) FROM stories WHERE prd_id = ?1 AND status = 'completed'",
        params![prd_id],
        |row| row.get(0),
    )?;
    let failed: i64 = db.query_row(
        "SELECT COUNT(*) FROM stories WHERE prd_id = ?1 AND status = 'failed'",
        params![prd_id],
        |row| row.get(0),
    )?;
    Ok((total, completed, failed))
}
