// CRUD operations for Stories.

use rusqlite::{params, Connection, Result as SqliteResult};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db_utils::{columns, DatabaseOps, QueryBuilder};
use crate::models::{Story, StoryStatus};

fn row_to_story(row: &rusqlite::Row) -> SqliteResult<Story> {
    let status_str: String = row.get(7)?;
    let criteria_json: Option<String> = row.get(5)?;
    let acceptance_criteria = criteria_json
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(Story {
        id: Some(row.get(0)?),
        prd_id: row.get(1)?,
        order_index: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        acceptance_criteria,
        priority: row.get(6)?,
        status: StoryStatus::from_str(&status_str),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        total_tasks: 0,
        completed_tasks: 0,
        failed_tasks: 0,
    })
}

pub struct StoryOps<'a> {
    db: &'a Arc<Mutex<Connection>>,
}

impl<'a> StoryOps<'a> {
    pub fn new(db: &'a Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        prd_id: i64,
        title: &str,
        description: &str,
        acceptance_criteria: Vec<String>,
        priority: i64,
    ) -> SqliteResult<Story> {
        let title = title.to_string();
        let description = description.to_string();
        let criteria_json = serde_json::to_string(&acceptance_criteria).unwrap_or_default();
        let now = chrono::Utc::now().to_rfc3339();

        let id = self
            .db
            .with_db(move |db| {
                let order_index: i64 = db.query_row(
                    "SELECT COALESCE(MAX(order_index) + 1, 0) FROM stories WHERE prd_id = ?1",
                    params![prd_id],
                    |row| row.get(0),
                )?;

                db.execute(
                    "INSERT INTO stories (prd_id, order_index, title, description, acceptance_criteria, priority, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                    params![
                        prd_id,
                        order_index,
                        title,
                        description,
                        criteria_json,
                        priority,
                        StoryStatus::Pending.as_str(),
                        now,
                    ],
                )?;
                Ok(db.last_insert_rowid())
            })
            .await?;

        Ok(self.get(id).await?.expect("row just inserted"))
    }

    pub async fn get(&self, id: i64) -> SqliteResult<Option<Story>> {
        self.db
            .with_db(move |db| {
                let query = format!("SELECT {} FROM stories WHERE id = ?1", columns::STORIES);
                let mut stmt = db.prepare(&query)?;
                let mut rows = stmt.query(params![id])?;
                if let Some(row) = rows.next()? {
                    let mut story = row_to_story(row)?;
                    let (total, completed, failed) = task_counts(db, id)?;
                    story.total_tasks = total;
                    story.completed_tasks = completed;
                    story.failed_tasks = failed;
                    Ok(Some(story))
                } else {
                    Ok(None)
                }
            })
            .await
    }

    pub async fn list(&self, prd_id: Option<i64>) -> SqliteResult<Vec<Story>> {
        self.db
            .with_db(move |db| {
                let base_query = format!("SELECT {} FROM stories WHERE 1=1", columns::STORIES);
                let mut builder = QueryBuilder::new(&base_query);
                if let Some(prd_id) = prd_id {
                    builder.add_condition("prd_id = ?", prd_id);
                }
                builder.add_order_by("order_index ASC");

                let (query, query_params) = builder.build();
                let mut stmt = db.prepare(&query)?;
                let param_refs = QueryBuilder::params_as_refs(&query_params);

                let stories = stmt.query_map(param_refs.as_slice(), row_to_story)?;
                let mut result = Vec::new();
                for story in stories {
                    let mut story = story?;
                    let id = story.id.expect("persisted story has id");
                    let (total, completed, failed) = task_counts(db, id)?;
                    story.total_tasks = total;
                    story.completed_tasks = completed;
                    story.failed_tasks = failed;
                    result.push(story);
                }
                Ok(result)
            })
            .await
    }

    pub async fn update_status(&self, id: i64, status: StoryStatus) -> SqliteResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .with_db(move |db| {
                db.execute(
                    "UPDATE stories SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, status.as_str(), now],
                )?;
                Ok(())
            })
            .await
    }
}

fn task_counts(db: &Connection, story_id: i64) -> SqliteResult<(i64, i64, i64)> {
    let total: i64 = db.query_row(
        "SELECT COUNT(*) FROM tasks WHERE story_id = ?1",
        params![story_id],
        |row| row.get(0),
    )?;
    let completed: i64 = db.query_row(
        "SELECT COUNT(*) FROM tasks WHERE story_id = ?1 AND status = 'completed'",
        params![story_id],
        |row| row.get(0),
    )?;
    let failed: i64 = db.query_row(
        "SELECT COUNT(*) FROM tasks WHERE story_id = ?1 AND status = 'failed'",
        params![story_id],
        |row| row.get(0),
    )?;
    Ok((total, completed, failed))
}
