// Runtime configuration for the orchestration core.
//
// Values are layered: a compiled-in default, overridden by a `.env`
// file (loaded once at process start via `dotenvy`), overridden by
// the process environment. Construction never panics on a bad value —
// invalid entries are logged and the default is kept, matching the
// `validate()`-logs-not-panics approach used elsewhere in this codebase.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ceiling on concurrently-dispatched tasks (default 3, hard ceiling 10).
    pub max_parallel: usize,
    /// Scheduler poll interval.
    pub poll_interval: Duration,
    /// Grace sleep between scheduler iterations.
    pub iteration_grace: Duration,
    /// Default per-task retry budget.
    pub default_max_retries: i32,
    /// Threshold past which an IN_PROGRESS task is considered orphaned.
    pub stale_task_timeout: Duration,

    /// Default timeout for one agent invocation.
    pub agent_timeout: Duration,
    /// Base delay for the agent-runner's exponential backoff (attempt n -> n+1).
    pub agent_retry_base_delay: Duration,
    /// Max attempts for one agent invocation (including the first).
    pub agent_max_retries: u32,
    /// Minimum characters batched before a streaming progress callback fires.
    pub stream_min_chars: usize,
    /// Minimum time batched before a streaming progress callback fires.
    pub stream_min_interval: Duration,

    /// Explicit path to the coding-agent binary; if unset, discovery runs (see agent_runner::discovery).
    pub agent_binary_path: Option<PathBuf>,
    /// Optional model override passed to the agent binary.
    pub agent_model: Option<String>,

    /// Whether quality gates run at all.
    pub run_quality_gates: bool,
    pub quality_gate_timeout_tests: Duration,
    pub quality_gate_timeout_typecheck: Duration,
    pub quality_gate_timeout_lint: Duration,

    /// Whether the independent verification pass runs.
    pub run_verification: bool,
    pub verification_timeout: Duration,
    pub verification_cache_ttl: Duration,
    pub verification_cache_max_entries: usize,
    pub max_verification_fix_attempts: u32,
    pub verification_diff_max_chars: usize,

    /// Cooldown manager defaults.
    pub cooldown_enabled: bool,
    pub cooldown_minutes: i64,
    pub cooldown_consecutive_threshold: u32,
    pub cooldown_failure_window: Duration,

    /// Resource admission thresholds.
    pub max_memory_percent: f32,
    pub min_available_mb: u64,

    /// Number of relevant learnings injected into context assembly.
    pub learning_context_limit: usize,
    pub learning_relevance_threshold: f64,

    /// Path to the SQLite database file backing all entities.
    pub db_path: PathBuf,

    /// Root directory under which each PRD's `project_name` resolves to a
    /// working tree (`projects_root.join(project_name)`), passed to the
    /// agent runner, git, and quality-gate subprocesses as the working dir.
    pub projects_root: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            poll_interval: Duration::from_secs(5),
            iteration_grace: Duration::from_secs(2),
            default_max_retries: 2,
            stale_task_timeout: Duration::from_secs(60 * 60),

            agent_timeout: Duration::from_secs(1800),
            agent_retry_base_delay: Duration::from_secs(5),
            agent_max_retries: 2,
            stream_min_chars: 50,
            stream_min_interval: Duration::from_secs(2),

            agent_binary_path: None,
            agent_model: None,

            run_quality_gates: true,
            quality_gate_timeout_tests: Duration::from_secs(300),
            quality_gate_timeout_typecheck: Duration::from_secs(120),
            quality_gate_timeout_lint: Duration::from_secs(60),

            run_verification: true,
            verification_timeout: Duration::from_secs(300),
            verification_cache_ttl: Duration::from_secs(300),
            verification_cache_max_entries: 100,
            max_verification_fix_attempts: 2,
            verification_diff_max_chars: 15_000,

            cooldown_enabled: true,
            cooldown_minutes: 60,
            cooldown_consecutive_threshold: 3,
            cooldown_failure_window: Duration::from_secs(300),

            max_memory_percent: 90.0,
            min_available_mb: 512,

            learning_context_limit: 10,
            learning_relevance_threshold: 0.1,

            db_path: PathBuf::from("orchestrator.db"),
            projects_root: PathBuf::from("."),
        }
    }
}

impl OrchestratorConfig {
    /// Load a `.env` file if present (ignored if missing) and layer
    /// environment overrides on top of the defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();

        if let Some(v) = env_usize("ORCHESTRATOR_MAX_PARALLEL") {
            cfg.max_parallel = v.clamp(1, 10);
        }
        if let Some(v) = env_u64("ORCHESTRATOR_POLL_INTERVAL_SECS") {
            cfg.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_i32("ORCHESTRATOR_DEFAULT_MAX_RETRIES") {
            cfg.default_max_retries = v;
        }
        if let Ok(path) = std::env::var("CLAUDE_PATH") {
            if !path.trim().is_empty() {
                cfg.agent_binary_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(model) = std::env::var("CLAUDE_CODE_MODEL") {
            if !model.trim().is_empty() {
                cfg.agent_model = Some(model);
            }
        }
        if let Some(v) = env_bool("ORCHESTRATOR_RUN_QUALITY_GATES") {
            cfg.run_quality_gates = v;
        }
        if let Some(v) = env_bool("ORCHESTRATOR_RUN_VERIFICATION") {
            cfg.run_verification = v;
        }
        if let Some(v) = env_i64("ORCHESTRATOR_COOLDOWN_MINUTES") {
            cfg.cooldown_minutes = v;
        }
        if let Some(v) = env_u32("ORCHESTRATOR_COOLDOWN_THRESHOLD") {
            cfg.cooldown_consecutive_threshold = v;
        }
        if let Ok(path) = std::env::var("ORCHESTRATOR_DB_PATH") {
            if !path.trim().is_empty() {
                cfg.db_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("ORCHESTRATOR_PROJECTS_ROOT") {
            if !path.trim().is_empty() {
                cfg.projects_root = PathBuf::from(path);
            }
        }

        cfg.validate();
        cfg
    }

    /// Sanity-check values that could otherwise wedge the scheduler; logs
    /// and corrects rather than panicking, since this runs at startup
    /// before a logger handle necessarily exists.
    fn validate(&mut self) {
        if self.max_parallel == 0 {
            eprintln!("[WARN] ORCHESTRATOR_MAX_PARALLEL was 0, clamping to 1");
            self.max_parallel = 1;
        }
        if self.max_parallel > 10 {
            eprintln!("[WARN] ORCHESTRATOR_MAX_PARALLEL exceeds ceiling of 10, clamping");
            self.max_parallel = 10;
        }
        if self.default_max_retries < 0 {
            eprintln!("[WARN] ORCHESTRATOR_DEFAULT_MAX_RETRIES negative, clamping to 0");
            self.default_max_retries = 0;
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_i32(key: &str) -> Option<i32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| match v.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.max_parallel, 3);
        assert_eq!(cfg.default_max_retries, 2);
        assert_eq!(cfg.max_verification_fix_attempts, 2);
    }

    #[test]
    fn validate_clamps_zero_parallelism() {
        let mut cfg = OrchestratorConfig::default();
        cfg.max_parallel = 0;
        cfg.validate();
        assert_eq!(cfg.max_parallel, 1);
    }

    #[test]
    fn validate_clamps_over_ceiling() {
        let mut cfg = OrchestratorConfig::default();
        cfg.max_parallel = 50;
        cfg.validate();
        assert_eq!(cfg.max_parallel, 10);
    }
}
