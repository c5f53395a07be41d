// Dependency-aware concurrent scheduling loop (§4.5): polls for QUEUED
// tasks, picks a batch whose dependencies are satisfied, dispatches each
// to the task executor under a worker semaphore, and propagates terminal
// task outcomes up to their story and PRD. Also owns stale-task crash
// recovery and the daily completion counters.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::cooldown::CooldownManager;
use crate::db::tasks::TaskListFilters;
use crate::db::Database;
use crate::error::AppResult;
use crate::executor::TaskExecutor;
use crate::logger::Logger;
use crate::models::{LoopStatus, PrdStatus, StoryStatus, Task, TaskStatus};
use crate::notify::{self, NotifyCallback};
use crate::resource_guard::ResourceGuard;

#[derive(Clone)]
pub struct Scheduler {
    db: Arc<Database>,
    executor: Arc<TaskExecutor>,
    cooldown: CooldownManager,
    config: OrchestratorConfig,
    logger: Arc<Logger>,
    notify: NotifyCallback,
    user_id: String,

    semaphore: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    in_progress: Arc<Mutex<HashSet<i64>>>,
    started_at: Arc<Mutex<Option<Instant>>>,
    tasks_completed_today: Arc<AtomicI64>,
    tasks_failed_today: Arc<AtomicI64>,
    last_reset_date: Arc<Mutex<chrono::NaiveDate>>,
    last_completed_at: Arc<Mutex<Option<String>>>,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    resource_guard: ResourceGuard,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        db: Arc<Database>,
        executor: Arc<TaskExecutor>,
        cooldown: CooldownManager,
        config: OrchestratorConfig,
        logger: Arc<Logger>,
        notify: NotifyCallback,
        user_id: impl Into<String>,
    ) -> Self {
        let max_parallel = config.max_parallel;
        let paused = Arc::new(AtomicBool::new(false));
        let resource_guard = ResourceGuard::new(config.max_memory_percent, config.min_available_mb);

        // Cooldown activation/deactivation pauses and resumes dispatch
        // without the scheduler needing to poll cooldown state itself on
        // every callback edge (it still checks `is_active()` each loop
        // iteration as a belt-and-braces fallback).
        let paused_for_activate = paused.clone();
        cooldown
            .on_activate(move || {
                let paused = paused_for_activate.clone();
                async move { paused.store(true, Ordering::SeqCst) }
            })
            .await;
        let paused_for_deactivate = paused.clone();
        cooldown
            .on_deactivate(move || {
                let paused = paused_for_deactivate.clone();
                async move { paused.store(false, Ordering::SeqCst) }
            })
            .await;

        Self {
            db,
            executor,
            cooldown,
            config,
            logger,
            notify,
            user_id: user_id.into(),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            running: Arc::new(AtomicBool::new(false)),
            paused,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
            started_at: Arc::new(Mutex::new(None)),
            tasks_completed_today: Arc::new(AtomicI64::new(0)),
            tasks_failed_today: Arc::new(AtomicI64::new(0)),
            last_reset_date: Arc::new(Mutex::new(chrono::Local::now().date_naive())),
            last_completed_at: Arc::new(Mutex::new(None)),
            loop_handle: Arc::new(Mutex::new(None)),
            resource_guard,
        }
    }

    /// Recover crash-orphaned tasks, then start the poll loop. Idempotent.
    pub async fn start(&self) -> AppResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.recover_stale_tasks().await?;
        *self.started_at.lock().await = Some(Instant::now());

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.loop_handle.lock().await.take() {
            handle.abort();
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub async fn status(&self) -> AppResult<LoopStatus> {
        let queue_depth = self
            .db
            .tasks()
            .list(TaskListFilters {
                status: Some(TaskStatus::Queued),
                ..Default::default()
            })
            .await?
            .len() as i64;

        let uptime_seconds = self
            .started_at
            .lock()
            .await
            .map(|at| at.elapsed().as_secs() as i64)
            .unwrap_or(0);

        let parallel_task_ids: Vec<i64> = self.in_progress.lock().await.iter().copied().collect();

        Ok(LoopStatus {
            running: self.running.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            current_task_id: parallel_task_ids.first().copied(),
            parallel_task_ids,
            max_parallel: self.config.max_parallel,
            queue_depth,
            tasks_completed_today: self.tasks_completed_today.load(Ordering::SeqCst),
            tasks_failed_today: self.tasks_failed_today.load(Ordering::SeqCst),
            last_completed_at: self.last_completed_at.lock().await.clone(),
            uptime_seconds,
        })
    }

    async fn run_loop(self) {
        while self.running.load(Ordering::SeqCst) {
            self.maybe_reset_daily_counters().await;

            if self.paused.load(Ordering::SeqCst) || self.cooldown.is_active().await {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            if let Err(e) = self.dispatch_once().await {
                let _ = self.logger.error("scheduler", &format!("dispatch error: {e}"), None, None).await;
            }

            tokio::time::sleep(self.config.iteration_grace).await;
        }
    }

    /// One scheduling iteration (§4.5 loop body): detect dependency
    /// cycles, select a batch of queued tasks whose dependencies are
    /// satisfied, and dispatch it.
    async fn dispatch_once(&self) -> AppResult<()> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return Ok(());
        }

        let resources = self.resource_guard.check();
        if !resources.ok {
            let _ = self
                .logger
                .warning(
                    "scheduler",
                    &format!(
                        "deferring dispatch: memory at {:.1}%, {} MB available",
                        resources.memory_percent, resources.available_mb
                    ),
                    None,
                    None,
                )
                .await;
            return Ok(());
        }

        let queued = self
            .db
            .tasks()
            .list(TaskListFilters {
                status: Some(TaskStatus::Queued),
                ..Default::default()
            })
            .await?;
        if queued.is_empty() {
            return Ok(());
        }

        let all = self.db.tasks().list(TaskListFilters::default()).await?;
        let active: Vec<Task> = all.iter().filter(|t| !t.status.is_terminal()).cloned().collect();
        let cycle_ids = detect_cycles(&active);
        for id in &cycle_ids {
            let _ = self
                .db
                .tasks()
                .update_status(*id, None, TaskStatus::Failed, Some("circular dependency detected".to_string()))
                .await;
        }

        let completed_ids: HashSet<i64> = all
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.id)
            .collect();

        let candidates: Vec<&Task> = queued.iter().filter(|t| !cycle_ids.contains(&t.id.unwrap_or(-1))).collect();
        let batch = select_batch(&candidates, &completed_ids, available.min(self.config.max_parallel));

        for task in batch {
            self.dispatch_task(task).await;
        }
        Ok(())
    }

    /// Claim ownership of a task via the atomic conditional status update,
    /// then run it to completion in a spawned worker once a semaphore
    /// permit is free. Losing the ownership race is silent and expected.
    async fn dispatch_task(&self, task: Task) {
        let task_id = task.id.expect("queued task has an id");

        if !crate::state_machine::is_valid_transition(task.status, TaskStatus::InProgress) {
            let _ = self
                .logger
                .warning("scheduler", &format!("refusing invalid transition {:?} -> InProgress for task {task_id}", task.status), None, None)
                .await;
            return;
        }

        let rows = match self.db.tasks().update_status(task_id, Some(TaskStatus::Queued), TaskStatus::InProgress, None).await {
            Ok(rows) => rows,
            Err(e) => {
                let _ = self.logger.error("scheduler", &format!("claim failed for task {task_id}: {e}"), None, None).await;
                return;
            }
        };
        if rows == 0 {
            return;
        }

        notify::notify(&self.notify, &self.user_id, format!("Task #{task_id} dispatched: {}", task.title)).await;

        let this = self.clone();
        tokio::spawn(async move {
            let Ok(permit) = this.semaphore.clone().acquire_owned().await else {
                return;
            };
            this.in_progress.lock().await.insert(task_id);

            let (final_status, result) = this.executor.execute(task, &this.user_id).await;

            this.in_progress.lock().await.remove(&task_id);
            this.record_completion(final_status).await;

            let message = match final_status {
                TaskStatus::Completed => format!("Task #{task_id} completed"),
                TaskStatus::Failed => format!("Task #{task_id} failed: {}", result.error.unwrap_or_default()),
                _ => format!("Task #{task_id} requeued for retry"),
            };
            notify::notify(&this.notify, &this.user_id, message).await;

            if let Err(e) = this.propagate_completion(task_id, final_status).await {
                let _ = this.logger.error("scheduler", &format!("propagate_completion failed: {e}"), None, None).await;
            }

            drop(permit);
        });
    }

    async fn record_completion(&self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => {
                self.tasks_completed_today.fetch_add(1, Ordering::SeqCst);
                *self.last_completed_at.lock().await = Some(chrono::Utc::now().to_rfc3339());
            }
            TaskStatus::Failed => {
                self.tasks_failed_today.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }

    /// When a terminal task leaves all of its story's siblings terminal,
    /// roll the story's status up (FAILED if any sibling failed, else
    /// COMPLETED), then do the same one level up from story to PRD.
    async fn propagate_completion(&self, task_id: i64, status: TaskStatus) -> AppResult<()> {
        if !status.is_terminal() {
            return Ok(());
        }

        let Some(task) = self.db.tasks().get(task_id).await? else {
            return Ok(());
        };
        let siblings = self
            .db
            .tasks()
            .list(TaskListFilters {
                story_id: Some(task.story_id),
                ..Default::default()
            })
            .await?;
        if !siblings.iter().all(|t| t.status.is_terminal()) {
            return Ok(());
        }

        let story_status = if siblings.iter().any(|t| t.status == TaskStatus::Failed) {
            StoryStatus::Failed
        } else {
            StoryStatus::Completed
        };
        self.db.stories().update_status(task.story_id, story_status).await?;

        let Some(story) = self.db.stories().get(task.story_id).await? else {
            return Ok(());
        };
        let prd_stories = self.db.stories().list(Some(story.prd_id)).await?;
        if !prd_stories.iter().all(|s| s.status.is_terminal()) {
            return Ok(());
        }

        self.db.prds().update_status(story.prd_id, PrdStatus::Completed).await?;
        if let Some(prd) = self.db.prds().get(story.prd_id).await? {
            let message = self.build_prd_summary(&prd).await;
            notify::notify(&self.notify, &self.user_id, message).await;
        }
        Ok(())
    }

    /// PRD-completion notification text (§4.5.3): total stories,
    /// completed/failed counts, the files changed across every task, and
    /// the wall-clock duration from PRD creation to completion.
    async fn build_prd_summary(&self, prd: &crate::models::Prd) -> String {
        let stories = self.db.stories().list(prd.id).await.unwrap_or_default();
        let mut files_changed: Vec<String> = Vec::new();
        for story in &stories {
            let tasks = self
                .db
                .tasks()
                .list(TaskListFilters {
                    story_id: story.id,
                    ..Default::default()
                })
                .await
                .unwrap_or_default();
            for task in tasks {
                files_changed.extend(task.files_changed);
            }
        }
        files_changed.sort();
        files_changed.dedup();

        let duration = chrono::DateTime::parse_from_rfc3339(&prd.created_at)
            .ok()
            .map(|start| (chrono::Utc::now() - start.with_timezone(&chrono::Utc)).num_seconds())
            .unwrap_or(0);

        format!(
            "PRD '{}' finished: {} stories ({} completed, {} failed), {} files changed, {}s elapsed",
            prd.title,
            prd.total_stories,
            prd.completed_stories,
            prd.failed_stories,
            files_changed.len(),
            duration,
        )
    }

    /// Requeue tasks left IN_PROGRESS/RUNNING_TESTS/VERIFYING past
    /// `stale_task_timeout`, assumed orphaned by a prior crash.
    async fn recover_stale_tasks(&self) -> AppResult<()> {
        let stale = self.db.tasks().list_in_progress().await?;
        let threshold = chrono::Utc::now()
            - chrono::Duration::from_std(self.config.stale_task_timeout).unwrap_or_else(|_| chrono::Duration::hours(1));

        for task in stale {
            let Some(task_id) = task.id else { continue };
            let is_stale = chrono::DateTime::parse_from_rfc3339(&task.updated_at)
                .map(|dt| dt.with_timezone(&chrono::Utc) < threshold)
                .unwrap_or(true);
            if is_stale {
                let _ = self.logger.warning("scheduler", &format!("recovering stale task {task_id}"), None, None).await;
                let _ = self.db.tasks().requeue_for_retry(task_id, "recovered from crash: stale in-progress task").await;
            }
        }
        Ok(())
    }

    async fn maybe_reset_daily_counters(&self) {
        let today = chrono::Local::now().date_naive();
        let mut last = self.last_reset_date.lock().await;
        if *last != today {
            *last = today;
            self.tasks_completed_today.store(0, Ordering::SeqCst);
            self.tasks_failed_today.store(0, Ordering::SeqCst);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

/// DFS cycle detection over the dependency graph (§4.5 Invariant 3):
/// every task id reachable in a cycle is returned so the caller can mark
/// it BLOCKED rather than ever dispatch it.
fn detect_cycles(tasks: &[Task]) -> HashSet<i64> {
    let by_id: HashMap<i64, &Task> = tasks.iter().filter_map(|t| t.id.map(|id| (id, t))).collect();
    let mut colors: HashMap<i64, Color> = HashMap::new();
    let mut in_cycle: HashSet<i64> = HashSet::new();

    fn visit(id: i64, by_id: &HashMap<i64, &Task>, colors: &mut HashMap<i64, Color>, stack: &mut Vec<i64>, in_cycle: &mut HashSet<i64>) {
        match colors.get(&id) {
            Some(Color::Black) => return,
            Some(Color::Gray) => {
                if let Some(pos) = stack.iter().position(|x| *x == id) {
                    for node in &stack[pos..] {
                        in_cycle.insert(*node);
                    }
                }
                return;
            }
            None => {}
        }

        colors.insert(id, Color::Gray);
        stack.push(id);
        if let Some(task) = by_id.get(&id) {
            for dep in &task.depends_on {
                if by_id.contains_key(dep) {
                    visit(*dep, by_id, colors, stack, in_cycle);
                }
            }
        }
        stack.pop();
        colors.insert(id, Color::Black);
    }

    let ids: Vec<i64> = by_id.keys().copied().collect();
    for id in ids {
        if !colors.contains_key(&id) {
            let mut stack = Vec::new();
            visit(id, &by_id, &mut colors, &mut stack, &mut in_cycle);
        }
    }
    in_cycle
}

/// Pick up to `capacity` queued tasks (priority-ordered) whose
/// dependencies are all COMPLETED. A task with unmet dependencies is
/// never dispatched (Invariant 4, §8 testable property), including the
/// head-of-queue task in the size-1 and empty-batch fallback cases.
fn select_batch(queued: &[&Task], completed_ids: &HashSet<i64>, capacity: usize) -> Vec<Task> {
    if capacity == 0 || queued.is_empty() {
        return Vec::new();
    }

    let deps_met = |t: &Task| t.depends_on.iter().all(|d| completed_ids.contains(d));

    if capacity == 1 {
        return queued.first().filter(|t| deps_met(t)).map(|t| (**t).clone()).into_iter().collect();
    }

    let mut batch: Vec<Task> = queued.iter().filter(|t| deps_met(t)).take(capacity).map(|t| (**t).clone()).collect();

    if batch.is_empty() {
        if let Some(head) = queued.first() {
            if deps_met(head) {
                batch.push((**head).clone());
            }
        }
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with(id: i64, depends_on: Vec<i64>) -> Task {
        let mut t = Task::new(1, 0, format!("t{id}"), "d".to_string(), 0);
        t.id = Some(id);
        t.depends_on = depends_on;
        t
    }

    #[test]
    fn select_batch_skips_unmet_dependencies() {
        let t1 = task_with(1, vec![]);
        let t2 = task_with(2, vec![99]);
        let queued = vec![&t2, &t1];
        let batch = select_batch(&queued, &HashSet::new(), 5);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, Some(1));
    }

    #[test]
    fn select_batch_size_one_requires_head_deps_met() {
        let t1 = task_with(1, vec![99]);
        let queued = vec![&t1];
        let batch = select_batch(&queued, &HashSet::new(), 1);
        assert!(batch.is_empty());
    }

    #[test]
    fn detect_cycles_finds_mutual_dependency() {
        let t1 = task_with(1, vec![2]);
        let t2 = task_with(2, vec![1]);
        let cycles = detect_cycles(&[t1, t2]);
        assert!(cycles.contains(&1));
        assert!(cycles.contains(&2));
    }

    #[test]
    fn detect_cycles_clean_dag_has_none() {
        let t1 = task_with(1, vec![]);
        let t2 = task_with(2, vec![1]);
        let t3 = task_with(3, vec![1, 2]);
        let cycles = detect_cycles(&[t1, t2, t3]);
        assert!(cycles.is_empty());
    }
}
