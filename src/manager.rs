// Autonomous manager (§4.11): a thin facade aggregating the persistence
// handle, scheduler, PRD breakdown, learning store and cooldown manager
// behind one async method per §6.1 command-surface row. Not itself
// interesting — it exists so an embedding front-end has a single type
// to hold and call.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::cooldown::CooldownManager;
use crate::db::tasks::TaskListFilters;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::executor::TaskExecutor;
use crate::models::{
    Learning, LearningCategory, LoopStatus, Prd, PrdStatus, Story, Task, TaskStatus,
};
use crate::notify::NotifyCallback;
use crate::prd_breakdown::PrdBreakdown;
use crate::scheduler::Scheduler;

/// A PRD together with its child stories, the shape `prd <id>` returns.
pub struct PrdDetail {
    pub prd: Prd,
    pub stories: Vec<Story>,
}

/// A story together with its child tasks, the shape `story <id>` returns.
pub struct StoryDetail {
    pub story: Story,
    pub tasks: Vec<Task>,
}

pub struct AutonomousManager {
    db: Arc<Database>,
    scheduler: Arc<Scheduler>,
    breakdown: PrdBreakdown,
    cooldown: CooldownManager,
    projects_root: PathBuf,
}

impl AutonomousManager {
    pub async fn new(config: OrchestratorConfig, logger: Arc<crate::logger::Logger>, notify: NotifyCallback, user_id: impl Into<String>) -> AppResult<Self> {
        let db = Arc::new(Database::new(config.db_path.clone())?);
        let agent = Arc::new(crate::agent_runner::AgentRunner::new(&config));
        let verification = Arc::new(crate::verification::VerificationAgent::new(agent.clone(), logger.clone(), &config));

        let cooldown_config = crate::cooldown::CooldownConfig {
            enabled: config.cooldown_enabled,
            cooldown_minutes: config.cooldown_minutes as u32,
            consecutive_threshold: config.cooldown_consecutive_threshold as usize,
            failure_window_seconds: config.cooldown_failure_window.as_secs(),
        };
        let cooldown = CooldownManager::new(cooldown_config, logger.clone());

        let executor = Arc::new(TaskExecutor::new(
            db.clone(),
            agent.clone(),
            verification,
            cooldown.clone(),
            logger.clone(),
            config.clone(),
            notify.clone(),
        ));

        let user_id = user_id.into();
        let scheduler = Arc::new(
            Scheduler::new(db.clone(), executor, cooldown.clone(), config.clone(), logger.clone(), notify, user_id).await,
        );

        let breakdown = PrdBreakdown::new(db.clone(), agent, scheduler.clone(), logger, config.agent_timeout);

        Ok(Self {
            db,
            scheduler,
            breakdown,
            cooldown,
            projects_root: config.projects_root,
        })
    }

    fn project_path(&self, project_name: &str) -> PathBuf {
        self.projects_root.join(project_name)
    }

    // -- prd --

    pub async fn prd_create(&self, user_id: &str, project_name: &str, title: &str, description: &str) -> AppResult<Prd> {
        Ok(self.db.prds().create(user_id, project_name, title, description).await?)
    }

    pub async fn prd_list(&self, user_id: &str, project_name: Option<&str>) -> AppResult<Vec<Prd>> {
        Ok(self.db.prds().list(user_id, project_name).await?)
    }

    pub async fn prd_get(&self, id: i64) -> AppResult<Option<PrdDetail>> {
        let Some(prd) = self.db.prds().get(id).await? else {
            return Ok(None);
        };
        let stories = self.db.stories().list(Some(id)).await?;
        Ok(Some(PrdDetail { prd, stories }))
    }

    pub async fn prd_set_status(&self, id: i64, status: PrdStatus) -> AppResult<()> {
        Ok(self.db.prds().update_status(id, status).await?)
    }

    // -- story --

    pub async fn story_create(&self, prd_id: i64, title: &str, description: &str, acceptance_criteria: Vec<String>) -> AppResult<Story> {
        Ok(self.db.stories().create(prd_id, title, description, acceptance_criteria, 0).await?)
    }

    pub async fn story_list(&self, prd_id: Option<i64>) -> AppResult<Vec<Story>> {
        Ok(self.db.stories().list(prd_id).await?)
    }

    pub async fn story_get(&self, id: i64) -> AppResult<Option<StoryDetail>> {
        let Some(story) = self.db.stories().get(id).await? else {
            return Ok(None);
        };
        let tasks = self
            .db
            .tasks()
            .list(TaskListFilters { story_id: Some(id), ..Default::default() })
            .await?;
        Ok(Some(StoryDetail { story, tasks }))
    }

    // -- task --

    pub async fn task_create(&self, story_id: i64, title: &str, description: &str) -> AppResult<Task> {
        Ok(self.db.tasks().create(story_id, title, description, 0, Vec::new()).await?)
    }

    pub async fn task_get(&self, id: i64) -> AppResult<Option<Task>> {
        Ok(self.db.tasks().get(id).await?)
    }

    pub async fn tasks_list(&self, status: Option<TaskStatus>) -> AppResult<Vec<Task>> {
        Ok(self
            .db
            .tasks()
            .list(TaskListFilters { status, ..Default::default() })
            .await?)
    }

    pub async fn queue_story(&self, story_id: i64) -> AppResult<usize> {
        let count = self.db.tasks().queue_tasks_for_story(story_id).await?;
        self.scheduler.start().await?;
        Ok(count)
    }

    pub async fn queue_prd(&self, prd_id: i64) -> AppResult<usize> {
        let count = self.db.tasks().queue_tasks_for_prd(prd_id).await?;
        self.scheduler.start().await?;
        Ok(count)
    }

    // -- autonomous loop control --

    pub async fn autonomous_start(&self) -> AppResult<()> {
        self.scheduler.start().await
    }

    pub async fn autonomous_stop(&self) {
        self.scheduler.stop().await
    }

    pub fn autonomous_pause(&self) {
        self.scheduler.pause()
    }

    pub fn autonomous_resume(&self) {
        self.scheduler.resume()
    }

    pub async fn autonomous_status(&self) -> AppResult<LoopStatus> {
        self.scheduler.status().await
    }

    // -- learnings --

    pub async fn learnings_list(&self, user_id: &str, project_name: Option<&str>, limit: usize) -> AppResult<Vec<Learning>> {
        Ok(self.db.learnings().list(user_id, project_name, None, limit).await?)
    }

    pub async fn learnings_search(&self, user_id: &str, project_name: Option<&str>, query: &str, limit: usize) -> AppResult<Vec<Learning>> {
        Ok(self.db.learnings().get_relevant(user_id, project_name, query, limit).await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn learnings_add(
        &self,
        user_id: &str,
        project_name: Option<&str>,
        category: &str,
        title: &str,
        content: &str,
    ) -> AppResult<Learning> {
        let category = LearningCategory::from_str(category);
        let keywords = crate::learning::extract_keywords(&format!("{title} {content}"), 10);
        Ok(self.db.learnings().store(user_id, project_name, None, category, title, content, keywords, 1.0).await?)
    }

    pub async fn learnings_decay(&self, days_threshold: i64) -> AppResult<usize> {
        Ok(self.db.learnings().decay_unused(days_threshold).await?)
    }

    // -- cooldown --

    pub async fn cooldown_status(&self) -> crate::cooldown::CooldownState {
        self.cooldown.state().await
    }

    pub async fn cooldown_clear(&self) {
        self.cooldown.deactivate().await
    }

    pub async fn cooldown_test(&self) {
        self.cooldown.activate(Some(1)).await
    }

    // -- complex --

    pub async fn complex(&self, user_id: &str, project_name: &str, request: &str) -> AppResult<Prd> {
        let project_path = self.project_path(project_name);
        if !project_path.is_dir() {
            return Err(AppError::Validation(crate::error::ValidationError::InvalidField {
                field: "project_name".to_string(),
                message: format!("{} is not a known project directory", project_path.display()),
            }));
        }
        self.breakdown.run(user_id, project_name, &project_path, request).await
    }
}
