// Core domain entities for the autonomous orchestration hierarchy:
// PRD -> Story -> Task, plus Learning and the sub-records attached
// to a completed task.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrdStatus {
    Draft,
    Active,
    Completed,
    Archived,
}

impl PrdStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrdStatus::Draft => "draft",
            PrdStatus::Active => "active",
            PrdStatus::Completed => "completed",
            PrdStatus::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "active" => PrdStatus::Active,
            "completed" => PrdStatus::Completed,
            "archived" => PrdStatus::Archived,
            _ => PrdStatus::Draft,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Failed,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Completed => "completed",
            StoryStatus::Blocked => "blocked",
            StoryStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "in_progress" => StoryStatus::InProgress,
            "completed" => StoryStatus::Completed,
            "blocked" => StoryStatus::Blocked,
            "failed" => StoryStatus::Failed,
            _ => StoryStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StoryStatus::Completed | StoryStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    InProgress,
    RunningTests,
    Verifying,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::RunningTests => "running_tests",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => TaskStatus::Queued,
            "in_progress" => TaskStatus::InProgress,
            "running_tests" => TaskStatus::RunningTests,
            "verifying" => TaskStatus::Verifying,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "blocked" => TaskStatus::Blocked,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EffortLevel {
    Low,
    Medium,
    High,
    Max,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PrdBreakdown,
    Implementation,
    BugFix,
    Refactor,
    Testing,
    Verification,
}

impl TaskType {
    /// Default effort level for this task type, per the configuration table in §4.6 step 2.
    pub fn default_effort(&self) -> EffortLevel {
        match self {
            TaskType::Implementation => EffortLevel::High,
            TaskType::BugFix => EffortLevel::High,
            TaskType::Refactor => EffortLevel::Medium,
            TaskType::Testing => EffortLevel::Medium,
            TaskType::PrdBreakdown => EffortLevel::Max,
            TaskType::Verification => EffortLevel::Max,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningCategory {
    Pattern,
    Pitfall,
    BestPractice,
    ProjectContext,
    Debugging,
    Architecture,
    Testing,
    ToolUsage,
}

impl LearningCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningCategory::Pattern => "pattern",
            LearningCategory::Pitfall => "pitfall",
            LearningCategory::BestPractice => "best_practice",
            LearningCategory::ProjectContext => "project_context",
            LearningCategory::Debugging => "debugging",
            LearningCategory::Architecture => "architecture",
            LearningCategory::Testing => "testing",
            LearningCategory::ToolUsage => "tool_usage",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pitfall" => LearningCategory::Pitfall,
            "best_practice" => LearningCategory::BestPractice,
            "project_context" => LearningCategory::ProjectContext,
            "debugging" => LearningCategory::Debugging,
            "architecture" => LearningCategory::Architecture,
            "testing" => LearningCategory::Testing,
            "tool_usage" => LearningCategory::ToolUsage,
            _ => LearningCategory::Pattern,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prd {
    pub id: Option<i64>,
    pub user_id: String,
    pub project_name: String,
    pub title: String,
    pub description: String,
    pub status: PrdStatus,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub metadata: Option<String>,
    pub total_stories: i64,
    pub completed_stories: i64,
    pub failed_stories: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: Option<i64>,
    pub prd_id: i64,
    pub order_index: i64,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    pub status: StoryStatus,
    pub created_at: String,
    pub updated_at: String,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QualityGateResult {
    pub tests_run: i64,
    pub tests_passed: i64,
    pub tests_failed: i64,
    pub typecheck_passed: Option<bool>,
    pub lint_passed: Option<bool>,
    pub output: String,
    pub execution_time_ms: i64,
    pub regression_detected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerificationResult {
    pub passed: bool,
    pub issues: Vec<String>,
    pub security_concerns: Vec<String>,
    pub logic_errors: Vec<String>,
    pub suggestions: Vec<String>,
    pub output: String,
    pub execution_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Option<i64>,
    pub story_id: i64,
    pub order_index: i64,
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub retry_count: i32,
    pub max_retries: i32,
    pub effort_level: Option<EffortLevel>,
    pub task_type: Option<TaskType>,
    pub depends_on: Vec<i64>,
    pub status: TaskStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub agent_output: Option<String>,
    pub files_changed: Vec<String>,
    pub quality_gate_result: Option<QualityGateResult>,
    pub verification_result: Option<VerificationResult>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    pub fn new(story_id: i64, order_index: i64, title: String, description: String, priority: i64) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: None,
            story_id,
            order_index,
            title,
            description,
            priority,
            retry_count: 0,
            max_retries: 2,
            effort_level: None,
            task_type: None,
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
            agent_output: None,
            files_changed: Vec::new(),
            quality_gate_result: None,
            verification_result: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: Option<i64>,
    pub user_id: String,
    pub project_name: Option<String>,
    pub source_task_id: Option<i64>,
    pub category: LearningCategory,
    pub title: String,
    pub content: String,
    pub relevance_keywords: Vec<String>,
    pub usage_count: i64,
    pub confidence: f64,
    pub last_used: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

/// Result of one task-executor pipeline run, returned to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub success: bool,
    pub error: Option<String>,
    pub agent_output: Option<String>,
    pub files_changed: Vec<String>,
    pub quality_gate_result: Option<QualityGateResult>,
    pub verification_result: Option<VerificationResult>,
}

/// Snapshot of the scheduling loop's state, returned by `autonomous status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStatus {
    pub running: bool,
    pub paused: bool,
    pub current_task_id: Option<i64>,
    pub parallel_task_ids: Vec<i64>,
    pub max_parallel: usize,
    pub queue_depth: i64,
    pub tasks_completed_today: i64,
    pub tasks_failed_today: i64,
    pub last_completed_at: Option<String>,
    pub uptime_seconds: i64,
}
