// CRUD operations for Tasks.
//
// Contains the handful of contracts the rest of the core relies on
// directly (§4.1): atomic single-row status updates, bulk enqueue as
// one transaction, and the head-of-queue probe used by the scheduler.

use rusqlite::{params, Connection, Result as SqliteResult};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db_utils::{columns, with_transaction, DatabaseOps, QueryBuilder};
use crate::models::{EffortLevel, QualityGateResult, Task, TaskStatus, TaskType, VerificationResult};

fn effort_to_str(e: EffortLevel) -> &'static str {
    match e {
        EffortLevel::Low => "LOW",
        EffortLevel::Medium => "MEDIUM",
        EffortLevel::High => "HIGH",
        EffortLevel::Max => "MAX",
    }
}

fn effort_from_str(s: &str) -> Option<EffortLevel> {
    match s {
        "LOW" => Some(EffortLevel::Low),
        "MEDIUM" => Some(EffortLevel::Medium),
        "HIGH" => Some(EffortLevel::High),
        "MAX" => Some(EffortLevel::Max),
        _ => None,
    }
}

fn task_type_to_str(t: TaskType) -> &'static str {
    match t {
        TaskType::PrdBreakdown => "prd_breakdown",
        TaskType::Implementation => "implementation",
        TaskType::BugFix => "bug_fix",
        TaskType::Refactor => "refactor",
        TaskType::Testing => "testing",
        TaskType::Verification => "verification",
    }
}

fn task_type_from_str(s: &str) -> Option<TaskType> {
    match s {
        "prd_breakdown" => Some(TaskType::PrdBreakdown),
        "implementation" => Some(TaskType::Implementation),
        "bug_fix" => Some(TaskType::BugFix),
        "refactor" => Some(TaskType::Refactor),
        "testing" => Some(TaskType::Testing),
        "verification" => Some(TaskType::Verification),
        _ => None,
    }
}

fn row_to_task(row: &rusqlite::Row) -> SqliteResult<Task> {
    let status_str: String = row.get(11)?;
    let effort_str: Option<String> = row.get(8)?;
    let type_str: Option<String> = row.get(9)?;
    let depends_on_json: Option<String> = row.get(10)?;
    let files_changed_json: Option<String> = row.get(16)?;
    let gate_json: Option<String> = row.get(17)?;
    let verification_json: Option<String> = row.get(18)?;

    Ok(Task {
        id: Some(row.get(0)?),
        story_id: row.get(1)?,
        order_index: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        priority: row.get(5)?,
        retry_count: row.get(6)?,
        max_retries: row.get(7)?,
        effort_level: effort_str.and_then(|s| effort_from_str(&s)),
        task_type: type_str.and_then(|s| task_type_from_str(&s)),
        depends_on: depends_on_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        status: TaskStatus::from_str(&status_str),
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
        error_message: row.get(14)?,
        agent_output: row.get(15)?,
        files_changed: files_changed_json
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        quality_gate_result: gate_json.and_then(|s| serde_json::from_str::<QualityGateResult>(&s).ok()),
        verification_result: verification_json
            .and_then(|s| serde_json::from_str::<VerificationResult>(&s).ok()),
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct TaskListFilters {
    pub story_id: Option<i64>,
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

pub struct TaskOps<'a> {
    db: &'a Arc<Mutex<Connection>>,
}

impl<'a> TaskOps<'a> {
    pub fn new(db: &'a Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        story_id: i64,
        title: &str,
        description: &str,
        priority: i64,
        depends_on: Vec<i64>,
    ) -> SqliteResult<Task> {
        let title = title.to_string();
        let description = description.to_string();
        let depends_on_json = serde_json::to_string(&depends_on).unwrap_or_default();
        let now = chrono::Utc::now().to_rfc3339();

        let id = self
            .db
            .with_db(move |db| {
                let order_index: i64 = db.query_row(
                    "SELECT COALESCE(MAX(order_index) + 1, 0) FROM tasks WHERE story_id = ?1",
                    params![story_id],
                    |row| row.get(0),
                )?;

                db.execute(
                    "INSERT INTO tasks (story_id, order_index, title, description, priority,
                        retry_count, max_retries, depends_on, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, 2, ?6, ?7, ?8, ?8)",
                    params![
                        story_id,
                        order_index,
                        title,
                        description,
                        priority,
                        depends_on_json,
                        TaskStatus::Pending.as_str(),
                        now,
                    ],
                )?;
                Ok(db.last_insert_rowid())
            })
            .await?;

        Ok(self.get(id).await?.expect("row just inserted"))
    }

    pub async fn get(&self, id: i64) -> SqliteResult<Option<Task>> {
        self.db
            .with_db(move |db| {
                let query = format!("SELECT {} FROM tasks WHERE id = ?1", columns::TASKS);
                let mut stmt = db.prepare(&query)?;
                let mut rows = stmt.query(params![id])?;
                rows.next()?.map(|r| row_to_task(r)).transpose()
            })
            .await
    }

    /// Filtered list ordered by (priority DESC, order ASC), per §4.1.
    pub async fn list(&self, filters: TaskListFilters) -> SqliteResult<Vec<Task>> {
        self.db
            .with_db(move |db| {
                let base_query = format!("SELECT {} FROM tasks WHERE 1=1", columns::TASKS);
                let mut builder = QueryBuilder::new(&base_query);
                if let Some(story_id) = filters.story_id {
                    builder.add_condition("story_id = ?", story_id);
                }
                if let Some(status) = filters.status {
                    builder.add_condition("status = ?", status.as_str().to_string());
                }
                builder.add_order_by("priority DESC, order_index ASC");
                if let Some(limit) = filters.limit {
                    builder.add_limit(limit);
                }

                let (query, query_params) = builder.build();
                let mut stmt = db.prepare(&query)?;
                let param_refs = QueryBuilder::params_as_refs(&query_params);
                let tasks = stmt.query_map(param_refs.as_slice(), row_to_task)?;
                tasks.collect()
            })
            .await
    }

    /// Highest-priority QUEUED task, or none. Does not remove it (§4.1).
    pub async fn get_next_queued(&self) -> SqliteResult<Option<Task>> {
        self.db
            .with_db(move |db| {
                let query = format!(
                    "SELECT {} FROM tasks WHERE status = 'queued' ORDER BY priority DESC, order_index ASC LIMIT 1",
                    columns::TASKS
                );
                let mut stmt = db.prepare(&query)?;
                let mut rows = stmt.query([])?;
                rows.next()?.map(|r| row_to_task(r)).transpose()
            })
            .await
    }

    /// Atomic single-row status update (§4.1). Conditioned on the task's
    /// current status so a lost race (another owner already moved it)
    /// is detectable via the returned row count.
    pub async fn update_status(
        &self,
        id: i64,
        expected_current: Option<TaskStatus>,
        new_status: TaskStatus,
        error_message: Option<String>,
    ) -> SqliteResult<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .with_db(move |db| {
                let rows = match (new_status, expected_current) {
                    (TaskStatus::InProgress, Some(expected)) => db.execute(
                        "UPDATE tasks SET status = ?3, started_at = ?4, updated_at = ?4
                         WHERE id = ?1 AND status = ?2",
                        params![id, expected.as_str(), new_status.as_str(), now],
                    )?,
                    (_, Some(expected)) => db.execute(
                        "UPDATE tasks SET status = ?3, error_message = ?4, updated_at = ?5
                         WHERE id = ?1 AND status = ?2",
                        params![id, expected.as_str(), new_status.as_str(), error_message, now],
                    )?,
                    (_, None) => db.execute(
                        "UPDATE tasks SET status = ?2, error_message = ?3, updated_at = ?4 WHERE id = ?1",
                        params![id, new_status.as_str(), error_message, now],
                    )?,
                };
                Ok(rows)
            })
            .await
    }

    /// Persist the outcome of a finished executor pipeline run.
    #[allow(clippy::too_many_arguments)]
    pub async fn complete(
        &self,
        id: i64,
        status: TaskStatus,
        error_message: Option<String>,
        agent_output: Option<String>,
        files_changed: Vec<String>,
        quality_gate_result: Option<QualityGateResult>,
        verification_result: Option<VerificationResult>,
    ) -> SqliteResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let files_json = serde_json::to_string(&files_changed).unwrap_or_default();
        let gate_json = quality_gate_result.and_then(|g| serde_json::to_string(&g).ok());
        let verification_json = verification_result.and_then(|v| serde_json::to_string(&v).ok());

        self.db
            .with_db(move |db| {
                db.execute(
                    "UPDATE tasks SET status = ?2, completed_at = ?3, updated_at = ?3,
                        error_message = ?4, agent_output = ?5, files_changed = ?6,
                        quality_gate_result = ?7, verification_result = ?8
                     WHERE id = ?1",
                    params![
                        id,
                        status.as_str(),
                        now,
                        error_message,
                        agent_output,
                        files_json,
                        gate_json,
                        verification_json,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Increment retry_count and requeue (failed-but-retryable path).
    pub async fn requeue_for_retry(&self, id: i64, reason: &str) -> SqliteResult<()> {
        let reason = reason.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .with_db(move |db| {
                db.execute(
                    "UPDATE tasks SET status = ?2, retry_count = retry_count + 1,
                        error_message = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![id, TaskStatus::Queued.as_str(), reason, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_effort_and_type(
        &self,
        id: i64,
        effort: EffortLevel,
        task_type: TaskType,
    ) -> SqliteResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .with_db(move |db| {
                db.execute(
                    "UPDATE tasks SET effort_level = ?2, task_type = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id, effort_to_str(effort), task_type_to_str(task_type), now],
                )?;
                Ok(())
            })
            .await
    }

    /// Bulk-enqueue all PENDING tasks in a story as one transaction;
    /// returns the count transitioned. Idempotent: a second call on an
    /// already-queued story queues nothing further.
    pub async fn queue_tasks_for_story(&self, story_id: i64) -> SqliteResult<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .with_db_mut(move |db| {
                with_transaction(db, |tx| {
                    tx.execute(
                        "UPDATE tasks SET status = 'queued', updated_at = ?2
                         WHERE story_id = ?1 AND status = 'pending'",
                        params![story_id, now],
                    )
                })
            })
            .await
    }

    /// Bulk-enqueue every PENDING task across all stories of a PRD.
    pub async fn queue_tasks_for_prd(&self, prd_id: i64) -> SqliteResult<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db
            .with_db_mut(move |db| {
                with_transaction(db, |tx| {
                    tx.execute(
                        "UPDATE tasks SET status = 'queued', updated_at = ?2
                         WHERE status = 'pending' AND story_id IN (
                            SELECT id FROM stories WHERE prd_id = ?1
                         )",
                        params![prd_id, now],
                    )
                })
            })
            .await
    }

    /// Tasks left IN_PROGRESS (from a prior crash), for stale recovery.
    pub async fn list_in_progress(&self) -> SqliteResult<Vec<Task>> {
        self.db
            .with_db(move |db| {
                let query = format!(
                    "SELECT {} FROM tasks WHERE status = 'in_progress' OR status = 'running_tests' OR status = 'verifying'",
                    columns::TASKS
                );
                let mut stmt = db.prepare(&query)?;
                let tasks = stmt.query_map([], row_to_task)?;
                tasks.collect()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::initialize_schema;

    async fn setup() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO prds (id, user_id, project_name, title, description, status, created_at, updated_at)
             VALUES (1, 'u', 'p', 't', 'd', 'active', 'now', 'now')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO stories (id, prd_id, order_index, title, description, priority, status, created_at, updated_at)
             VALUES (1, 1, 0, 't', 'd', 0, 'pending', 'now', 'now')",
            [],
        )
        .unwrap();
        Arc::new(Mutex::new(conn))
    }

    #[tokio::test]
    async fn queue_tasks_for_story_is_idempotent() {
        let db = setup().await;
        let ops = TaskOps::new(&db);
        ops.create(1, "a", "b", 0, vec![]).await.unwrap();
        ops.create(1, "c", "d", 0, vec![]).await.unwrap();

        let first = ops.queue_tasks_for_story(1).await.unwrap();
        let second = ops.queue_tasks_for_story(1).await.unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn get_next_queued_does_not_remove() {
        let db = setup().await;
        let ops = TaskOps::new(&db);
        ops.create(1, "a", "b", 5, vec![]).await.unwrap();
        ops.queue_tasks_for_story(1).await.unwrap();

        let first = ops.get_next_queued().await.unwrap();
        let second = ops.get_next_queued().await.unwrap();
        assert_eq!(first.unwrap().id, second.unwrap().id);
    }

    #[tokio::test]
    async fn atomic_update_rejects_lost_race() {
        let db = setup().await;
        let ops = TaskOps::new(&db);
        let task = ops.create(1, "a", "b", 0, vec![]).await.unwrap();
        let id = task.id.unwrap();
        ops.queue_tasks_for_story(1).await.unwrap();

        let rows = ops
            .update_status(id, Some(TaskStatus::Queued), TaskStatus::InProgress, None)
            .await
            .unwrap();
        assert_eq!(rows, 1);

        // Second attempt from a stale view (still believes it's QUEUED) loses the race.
        let rows = ops
            .update_status(id, Some(TaskStatus::Queued), TaskStatus::InProgress, None)
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }
}
