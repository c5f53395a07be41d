// Task executor (§4.6): the per-task pipeline run by a worker holding a
// scheduler semaphore slot. Ten steps — context assembly, effort/type
// inference, git checkpoint, baseline snapshot, agent invocation, post-agent
// commit, quality gates, verification, auto-fix loop, outcome classification
// — each grounded on the corresponding subsystem module built earlier
// (agent_runner, quality_gates, verification, learning, cooldown).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::agent_runner::classify::ErrorCategory;
use crate::agent_runner::AgentRunner;
use crate::config::OrchestratorConfig;
use crate::cooldown::CooldownManager;
use crate::db::Database;
use crate::db::tasks::TaskListFilters;
use crate::error::AppResult;
use crate::learning::LearningExtractor;
use crate::logger::Logger;
use crate::models::{
    EffortLevel, Prd, QualityGateResult, Story, Task, TaskExecutionResult, TaskStatus, TaskType,
    VerificationResult,
};
use crate::notify::{self, NotifyCallback};
use crate::quality_gates::QualityGateRunner;
use crate::verification::VerificationAgent;

const MAX_AUTOFIX_WALL_CLOCK: Duration = Duration::from_secs(10 * 60);

/// Per-task pipeline orchestrating the agent runner, quality gates,
/// verification and learning extraction. Shared across worker tasks
/// dispatched by the scheduler; all interior mutability lives in the
/// subsystems it wraps (the git lock here, the verification cache inside
/// `VerificationAgent`).
pub struct TaskExecutor {
    db: Arc<Database>,
    agent: Arc<AgentRunner>,
    quality_gates: QualityGateRunner,
    verification: Arc<VerificationAgent>,
    cooldown: CooldownManager,
    logger: Arc<Logger>,
    config: OrchestratorConfig,
    notify: NotifyCallback,
    /// Process-wide git lock (§5 "Shared resources"): two workers on the
    /// same project serialize their commits; different projects do not
    /// contend since each `TaskExecutor` instance is process-wide but the
    /// lock itself is keyed by nothing finer than "one git tree at a time"
    /// per the source design.
    git_lock: Arc<Mutex<()>>,
}

impl TaskExecutor {
    pub fn new(
        db: Arc<Database>,
        agent: Arc<AgentRunner>,
        verification: Arc<VerificationAgent>,
        cooldown: CooldownManager,
        logger: Arc<Logger>,
        config: OrchestratorConfig,
        notify: NotifyCallback,
    ) -> Self {
        let quality_gates = QualityGateRunner::new(
            config.quality_gate_timeout_tests,
            config.quality_gate_timeout_typecheck,
            config.quality_gate_timeout_lint,
        );
        Self {
            db,
            agent,
            quality_gates,
            verification,
            cooldown,
            logger,
            config,
            notify,
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    fn project_path(&self, project_name: &str) -> std::path::PathBuf {
        self.config.projects_root.join(project_name)
    }

    /// Run the full pipeline for one IN_PROGRESS task. Persists the final
    /// status itself (COMPLETED / FAILED / requeued to QUEUED); returns the
    /// terminal-or-requeued status and execution result so the caller
    /// (the scheduler) can drive completion propagation.
    pub async fn execute(&self, task: Task, user_id: &str) -> (TaskStatus, TaskExecutionResult) {
        let task_id = task.id.expect("dispatched task has an id");

        match self.run_pipeline(&task, user_id).await {
            Ok((result, regressed_learning)) => self.classify_outcome(&task, result, regressed_learning).await,
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .logger
                    .error("executor", &format!("task {task_id} pipeline error: {message}"), None, None)
                    .await;
                let result = TaskExecutionResult {
                    success: false,
                    error: Some(message.clone()),
                    agent_output: None,
                    files_changed: Vec::new(),
                    quality_gate_result: None,
                    verification_result: None,
                };
                self.classify_outcome(&task, result, None).await
            }
        }
    }

    async fn run_pipeline(
        &self,
        task: &Task,
        user_id: &str,
    ) -> AppResult<(TaskExecutionResult, Option<QualityGateResult>)> {
        let task_id = task.id.expect("dispatched task has an id");
        let story = self.db.stories().get(task.story_id).await?;
        let prd = match &story {
            Some(s) => self.db.prds().get(s.prd_id).await?,
            None => None,
        };
        let project_name = prd.as_ref().map(|p| p.project_name.clone()).unwrap_or_default();
        let project_path = self.project_path(&project_name);

        notify::notify(&self.notify, user_id, format!("Starting task #{task_id}: {}", task.title)).await;

        // Step 1: context assembly.
        let siblings = self
            .db
            .tasks()
            .list(TaskListFilters {
                story_id: Some(task.story_id),
                status: Some(TaskStatus::Completed),
                limit: None,
            })
            .await?;
        let query = format!("{} {}", task.title, task.description);
        let learnings = self
            .db
            .learnings()
            .get_relevant(user_id, Some(&project_name), &query, self.config.learning_context_limit)
            .await?;
        let context = assemble_context(&story, &prd, &siblings, &learnings);
        let _estimated_tokens = context.chars().count() / 4;

        // Step 2: effort & type inference.
        let task_type = task.task_type.unwrap_or_else(|| infer_task_type(&task.title, &task.description));
        let effort = task.effort_level.unwrap_or_else(|| task_type.default_effort());
        if task.task_type.is_none() || task.effort_level.is_none() {
            self.db.tasks().set_effort_and_type(task_id, effort, task_type).await?;
        }

        // Step 3: git checkpoint.
        self.git_checkpoint(&project_path, task_id, &task.title).await;

        // Step 4: baseline snapshot.
        let baseline = if self.config.run_quality_gates {
            Some(self.quality_gates.snapshot_baseline(&project_path).await)
        } else {
            None
        };

        // Step 5: prompt assembly and agent invocation.
        let prompt = build_task_prompt(task, &context);
        let outcome = self.agent.run(&prompt, self.config.agent_timeout, &project_path, None, false).await?;

        if !outcome.success {
            if matches!(outcome.category, Some(ErrorCategory::RateLimited)) {
                self.cooldown.record_rate_limit_failure().await;
            }
            let result = TaskExecutionResult {
                success: false,
                error: Some(outcome.text),
                agent_output: None,
                files_changed: Vec::new(),
                quality_gate_result: None,
                verification_result: None,
            };
            return Ok((result, None));
        }

        // Step 6: post-agent commit + file-list parsing.
        self.git_checkpoint(&project_path, task_id, &task.title).await;
        let files_changed = parse_files_changed(&outcome.text);

        // Step 7: quality gates with baseline comparison.
        let gate_result = if self.config.run_quality_gates {
            Some(self.quality_gates.run(&project_path, true, true, true, baseline.as_ref()).await)
        } else {
            None
        };
        let gate_passed = gate_result
            .as_ref()
            .map(|g| g.tests_failed == 0 && g.typecheck_passed != Some(false) && g.lint_passed != Some(false))
            .unwrap_or(true);

        // Step 8: independent verification.
        let mut verification_result = if self.config.run_verification && gate_passed {
            Some(
                self.verification
                    .verify(task, &outcome.text, &files_changed, story.as_ref(), &project_path)
                    .await,
            )
        } else {
            None
        };

        // Step 9: bounded auto-fix loop.
        if let Some(result) = &verification_result {
            if !result.passed && has_critical_findings(result) {
                verification_result = Some(
                    self.run_autofix_loop(task, &project_path, &outcome.text, &files_changed, story.as_ref(), result.clone())
                        .await,
                );
            }
        }

        let verification_passed = verification_result.as_ref().map(|v| v.passed).unwrap_or(true);
        let success = gate_passed && verification_passed;

        let result = TaskExecutionResult {
            success,
            error: if success {
                None
            } else if !gate_passed {
                Some("quality gates failed".to_string())
            } else {
                Some("verification failed".to_string())
            },
            agent_output: Some(outcome.text),
            files_changed,
            quality_gate_result: gate_result.clone(),
            verification_result,
        };

        Ok((result, gate_result))
    }

    /// Step 9 body: re-invoke a fresh agent instance with the outstanding
    /// findings, then re-verify, up to `max_verification_fix_attempts`
    /// times or until the wall-clock budget is spent. The last verification
    /// result is always what's returned, win or lose.
    async fn run_autofix_loop(
        &self,
        task: &Task,
        project_path: &Path,
        agent_output: &str,
        files_changed: &[String],
        story: Option<&Story>,
        mut last_result: VerificationResult,
    ) -> VerificationResult {
        let budget_start = Instant::now();

        for attempt in 1..=self.config.max_verification_fix_attempts {
            if budget_start.elapsed() > MAX_AUTOFIX_WALL_CLOCK {
                break;
            }
            if !has_critical_findings(&last_result) {
                break;
            }

            let fix_prompt = build_fix_prompt(task, &last_result);
            let fix_outcome = self.agent.run(&fix_prompt, self.config.agent_timeout, project_path, None, false).await;

            let Ok(fix_outcome) = fix_outcome else { break };
            if !fix_outcome.success {
                let _ = self
                    .logger
                    .warning("executor", &format!("auto-fix attempt {attempt} failed to invoke"), None, None)
                    .await;
                break;
            }

            self.git_checkpoint(project_path, task.id.unwrap_or(0), &task.title).await;

            last_result = self
                .verification
                .verify(task, agent_output, files_changed, story, project_path)
                .await;
        }

        last_result
    }

    /// Step 10: extract learnings, persist the final status, and return it.
    async fn classify_outcome(
        &self,
        task: &Task,
        result: TaskExecutionResult,
        _gate_for_learning: Option<QualityGateResult>,
    ) -> (TaskStatus, TaskExecutionResult) {
        let task_id = task.id.expect("dispatched task has an id");

        let learnings = LearningExtractor::extract(
            task,
            result.success,
            result.error.as_deref(),
            result.agent_output.as_deref(),
            &result.files_changed,
            result.quality_gate_result.as_ref(),
        );

        let project_name = self.resolve_project_name(task.story_id).await;
        for l in &learnings {
            let _ = self
                .db
                .learnings()
                .store(
                    "system",
                    project_name.as_deref(),
                    Some(task_id),
                    l.category,
                    &l.title,
                    &l.content,
                    l.relevance_keywords.clone(),
                    l.confidence,
                )
                .await;
        }

        if result.success {
            self.warn_on_invalid_transition(task, TaskStatus::Completed).await;
            let _ = self
                .db
                .tasks()
                .complete(
                    task_id,
                    TaskStatus::Completed,
                    None,
                    result.agent_output.clone(),
                    result.files_changed.clone(),
                    result.quality_gate_result.clone(),
                    result.verification_result.clone(),
                )
                .await;
            return (TaskStatus::Completed, result);
        }

        let reason = result.error.clone().unwrap_or_else(|| "task failed".to_string());
        if task.retry_count < task.max_retries {
            self.warn_on_invalid_transition(task, TaskStatus::Queued).await;
            let _ = self.db.tasks().requeue_for_retry(task_id, &reason).await;
            (TaskStatus::Queued, result)
        } else {
            self.warn_on_invalid_transition(task, TaskStatus::Failed).await;
            let _ = self
                .db
                .tasks()
                .complete(
                    task_id,
                    TaskStatus::Failed,
                    Some(reason),
                    result.agent_output.clone(),
                    result.files_changed.clone(),
                    result.quality_gate_result.clone(),
                    result.verification_result.clone(),
                )
                .await;
            (TaskStatus::Failed, result)
        }
    }

    async fn warn_on_invalid_transition(&self, task: &Task, to: TaskStatus) {
        if !crate::state_machine::is_valid_transition(task.status, to) {
            let _ = self
                .logger
                .warning("executor", &format!("unexpected transition {:?} -> {to:?} for task {}", task.status, task.id.unwrap_or(-1)), None, None)
                .await;
        }
    }

    async fn resolve_project_name(&self, story_id: i64) -> Option<String> {
        let story = self.db.stories().get(story_id).await.ok().flatten()?;
        let prd = self.db.prds().get(story.prd_id).await.ok().flatten()?;
        Some(prd.project_name)
    }

    /// Steps 3 & 6: under the process-wide git lock, commit any
    /// uncommitted changes with a task-identifying, control-char-stripped
    /// message. Best-effort: a project with no git repository, or any git
    /// failure, is logged and otherwise ignored — it must not fail the task.
    async fn git_checkpoint(&self, project_path: &Path, task_id: i64, title: &str) {
        let _guard = self.git_lock.lock().await;

        let Ok(status) = run_git(project_path, &["status", "--porcelain"]).await else {
            return;
        };
        if status.trim().is_empty() {
            return;
        }

        if run_git(project_path, &["add", "-A"]).await.is_err() {
            return;
        }

        let clean_title: String = title.chars().filter(|c| !c.is_control()).collect();
        let message = format!("task #{task_id}: {clean_title}");
        if let Err(e) = run_git(project_path, &["commit", "-m", &message, "--no-verify"]).await {
            let _ = self.logger.warning("executor", &format!("git commit failed: {e}"), None, None).await;
        }
    }
}

async fn run_git(project_path: &Path, args: &[&str]) -> std::io::Result<String> {
    let output = Command::new("git").args(args).current_dir(project_path).output().await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn has_critical_findings(result: &VerificationResult) -> bool {
    !result.security_concerns.is_empty() || !result.logic_errors.is_empty()
}

fn assemble_context(story: &Option<Story>, prd: &Option<Prd>, siblings: &[Task], learnings: &[crate::models::Learning]) -> String {
    let mut parts = Vec::new();
    if let Some(prd) = prd {
        parts.push(format!("PRD: {}\n{}", prd.title, prd.description));
    }
    if let Some(story) = story {
        parts.push(format!("Story: {}\n{}", story.title, story.description));
        if !story.acceptance_criteria.is_empty() {
            parts.push(format!("Acceptance criteria:\n- {}", story.acceptance_criteria.join("\n- ")));
        }
    }
    if !siblings.is_empty() {
        let titles: Vec<String> = siblings.iter().map(|t| format!("- {}", t.title)).collect();
        parts.push(format!("Previously completed tasks in this story:\n{}", titles.join("\n")));
    }
    if !learnings.is_empty() {
        let items: Vec<String> = learnings.iter().map(|l| format!("- [{}] {}: {}", l.category.as_str(), l.title, l.content)).collect();
        parts.push(format!("Relevant learnings:\n{}", items.join("\n")));
    }
    parts.join("\n\n")
}

fn build_task_prompt(task: &Task, context: &str) -> String {
    format!(
        "{context}\n\n\
         Task: {}\n\
         {}\n\n\
         Implement this task directly in the project working directory. Requirements:\n\
         - Write or update tests covering the change.\n\
         - Validate inputs at system boundaries.\n\
         - Never hardcode secrets, API keys, or credentials.\n\
         - Handle errors explicitly; do not swallow them silently.\n\
         - At the end, list every file you created or modified.",
        task.title, task.description,
    )
}

fn build_fix_prompt(task: &Task, result: &VerificationResult) -> String {
    let mut issues = Vec::new();
    issues.extend(result.security_concerns.iter().map(|s| format!("- [security] {s}")));
    issues.extend(result.logic_errors.iter().map(|s| format!("- [logic] {s}")));
    format!(
        "A reviewer found the following issues with the implementation of task '{}':\n\n{}\n\n\
         Fix every issue listed above in the project working directory, then list every file you modified.",
        task.title,
        issues.join("\n"),
    )
}

/// Step 6: pull a file list out of free-text agent output by matching
/// common "Created/Modified/Updated/Added/Deleted <path>" phrasing,
/// filtering out anything that looks like a URL rather than a path.
fn parse_files_changed(agent_output: &str) -> Vec<String> {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:[-*]\s*)?(?:Created|Modified|Updated|Added|Deleted|Changed):?\s+`?([^\s`]+)`?\s*$").unwrap()
    });

    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for cap in re.captures_iter(agent_output) {
        let path = cap[1].trim_matches(|c| c == '`' || c == '\'' || c == '"');
        if path.starts_with("http://") || path.starts_with("https://") {
            continue;
        }
        if seen.insert(path.to_string()) {
            files.push(path.to_string());
        }
    }
    files
}

const IMPLEMENTATION_KEYWORDS: &[&str] = &["implement", "add", "create", "build", "support", "feature"];
const BUG_FIX_KEYWORDS: &[&str] = &["fix", "bug", "error", "crash", "broken", "incorrect", "regression"];
const REFACTOR_KEYWORDS: &[&str] = &["refactor", "cleanup", "clean up", "restructure", "simplify", "reorganize"];
const TESTING_KEYWORDS: &[&str] = &["test", "coverage", "assert", "spec", "unit test", "integration test"];
const VERIFICATION_KEYWORDS: &[&str] = &["verify", "audit", "review", "validate", "check"];
const PRD_BREAKDOWN_KEYWORDS: &[&str] = &["breakdown", "decompose", "plan", "requirements", "prd"];

/// Step 2: infer a task's type by keyword scoring of title+description
/// against fixed keyword sets (§4.6 step 2). Highest score wins; ties
/// favor Implementation as the most general default.
fn infer_task_type(title: &str, description: &str) -> TaskType {
    let text = format!("{} {}", title, description).to_lowercase();
    let score = |keywords: &[&str]| keywords.iter().filter(|k| text.contains(*k)).count();

    let scored = [
        (TaskType::BugFix, score(BUG_FIX_KEYWORDS)),
        (TaskType::Testing, score(TESTING_KEYWORDS)),
        (TaskType::Verification, score(VERIFICATION_KEYWORDS)),
        (TaskType::Refactor, score(REFACTOR_KEYWORDS)),
        (TaskType::PrdBreakdown, score(PRD_BREAKDOWN_KEYWORDS)),
        (TaskType::Implementation, score(IMPLEMENTATION_KEYWORDS)),
    ];

    scored
        .into_iter()
        .filter(|(_, s)| *s > 0)
        .max_by_key(|(_, s)| *s)
        .map(|(t, _)| t)
        .unwrap_or(TaskType::Implementation)
}

/// Default effort level per task type (§4.6 step 2 configuration table).
/// Exposed for callers that only have a `TaskType` and no config override;
/// `TaskType::default_effort` (models.rs) is the canonical source.
pub fn default_effort_for(task_type: TaskType) -> EffortLevel {
    task_type.default_effort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_bug_fix_from_keywords() {
        assert_eq!(infer_task_type("Fix crash on startup", "the app crashes when..."), TaskType::BugFix);
    }

    #[test]
    fn infers_testing_from_keywords() {
        assert_eq!(infer_task_type("Add unit test coverage", "write tests for the parser"), TaskType::Testing);
    }

    #[test]
    fn defaults_to_implementation_with_no_keyword_hits() {
        assert_eq!(infer_task_type("Do the thing", "the thing needs doing"), TaskType::Implementation);
    }

    #[test]
    fn parses_created_and_modified_file_lines() {
        let output = "Summary:\nCreated: src/foo.rs\nModified: src/lib.rs\nSee https://example.com/docs for reference\n";
        let files = parse_files_changed(output);
        assert_eq!(files, vec!["src/foo.rs".to_string(), "src/lib.rs".to_string()]);
    }

    #[test]
    fn critical_findings_require_security_or_logic_issues() {
        let mut result = VerificationResult::default();
        assert!(!has_critical_findings(&result));
        result.security_concerns.push("sql injection".to_string());
        assert!(has_critical_findings(&result));
    }
}
