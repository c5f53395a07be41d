// Agent runner: wraps the external coding-agent subprocess (§4.3).
// Not the hard part of the core, but its contract shapes the rest of
// the design — task executor, quality gates, and verification all
// invoke the agent through this one surface.

pub mod classify;
pub mod discovery;
pub mod process;
pub mod stream;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::OrchestratorConfig;
use crate::error::{AppError, AppResult};
use classify::{classify_error, ErrorCategory};
use process::SpawnOptions;
use stream::{consume_stream, parse_json_result, StreamEvent};

pub type ProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Outcome of one `run`/`run_structured` call, after any internal retries.
#[derive(Debug, Clone)]
pub struct AgentRunOutcome {
    pub success: bool,
    pub text: String,
    pub category: Option<ErrorCategory>,
}

struct InvocationState {
    cancelled: bool,
}

/// Invokes the coding-agent subprocess, with retry/backoff, streaming
/// progress batching, and cooperative cancellation.
pub struct AgentRunner {
    binary: String,
    model: Option<String>,
    max_retries: u32,
    base_delay: Duration,
    stream_min_chars: usize,
    stream_min_interval: Duration,
    invocations: Arc<Mutex<HashMap<u64, InvocationState>>>,
    next_id: AtomicU64,
    project_root: Arc<Mutex<Option<PathBuf>>>,
}

impl AgentRunner {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            binary: discovery::resolve_agent_binary(config.agent_binary_path.as_ref()),
            model: config.agent_model.clone(),
            max_retries: config.agent_max_retries,
            base_delay: config.agent_retry_base_delay,
            stream_min_chars: config.stream_min_chars,
            stream_min_interval: config.stream_min_interval,
            invocations: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            project_root: Arc::new(Mutex::new(None)),
        }
    }

    /// Validate and record the working directory used for subsequent
    /// invocations. Refuses paths that don't exist.
    pub async fn set_project(&self, path: &Path) -> AppResult<()> {
        if !path.is_dir() {
            return Err(AppError::Validation(crate::error::ValidationError::InvalidField {
                field: "project_path".to_string(),
                message: format!("{} is not a directory", path.display()),
            }));
        }
        *self.project_root.lock().await = Some(path.to_path_buf());
        Ok(())
    }

    /// Broadcast cancellation: mark every in-flight invocation cancelled.
    /// The running attempt observes this between retries and stops
    /// rather than issuing another attempt.
    pub async fn cancel(&self) {
        let mut invocations = self.invocations.lock().await;
        for state in invocations.values_mut() {
            state.cancelled = true;
        }
    }

    async fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.invocations.lock().await.insert(id, InvocationState { cancelled: false });
        id
    }

    async fn unregister(&self, id: u64) {
        self.invocations.lock().await.remove(&id);
    }

    async fn is_cancelled(&self, id: u64) -> bool {
        self.invocations
            .lock()
            .await
            .get(&id)
            .map(|s| s.cancelled)
            .unwrap_or(false)
    }

    /// Run one prompt to completion, retrying TRANSIENT failures up to
    /// `max_retries` times with exponential backoff. RATE_LIMITED and
    /// PERMANENT/INFRASTRUCTURE failures return immediately.
    pub async fn run(
        &self,
        prompt: &str,
        timeout: Duration,
        project_path: &Path,
        progress_cb: Option<ProgressCallback>,
        stream: bool,
    ) -> AppResult<AgentRunOutcome> {
        let id = self.register().await;
        let result = self.run_inner(id, prompt, timeout, project_path, progress_cb, stream, None).await;
        self.unregister(id).await;
        result
    }

    async fn run_inner(
        &self,
        id: u64,
        prompt: &str,
        timeout: Duration,
        project_path: &Path,
        progress_cb: Option<ProgressCallback>,
        stream: bool,
        schema: Option<&str>,
    ) -> AppResult<AgentRunOutcome> {
        let mut attempt = 0u32;
        loop {
            if self.is_cancelled(id).await {
                return Ok(AgentRunOutcome {
                    success: false,
                    text: "cancelled".to_string(),
                    category: None,
                });
            }

            let outcome = self
                .attempt_once(prompt, timeout, project_path, progress_cb.clone(), stream, schema)
                .await?;

            if outcome.success {
                return Ok(outcome);
            }

            match outcome.category {
                Some(ErrorCategory::Transient) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.base_delay * 2u32.pow(attempt.saturating_sub(1));
                    tokio::time::sleep(delay).await;
                    continue;
                }
                _ => return Ok(outcome),
            }
        }
    }

    async fn attempt_once(
        &self,
        prompt: &str,
        timeout: Duration,
        project_path: &Path,
        progress_cb: Option<ProgressCallback>,
        stream: bool,
        schema: Option<&str>,
    ) -> AppResult<AgentRunOutcome> {
        let opts = SpawnOptions {
            binary: &self.binary,
            working_dir: project_path,
            model: self.model.as_deref(),
            stream,
            schema,
        };

        let mut child = process::spawn(opts)?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let stdout = child.stdout.take();
        let min_chars = self.stream_min_chars;
        let min_interval = self.stream_min_interval;

        let stdout_task: tokio::task::JoinHandle<(String, bool)> = if stream {
            let stdout = stdout.expect("stdout piped at spawn");
            tokio::spawn(async move {
                let mut final_text = String::new();
                let mut final_is_error = false;
                consume_stream(stdout, min_chars, min_interval, |event| match event {
                    StreamEvent::Progress(text) => {
                        if let Some(cb) = &progress_cb {
                            cb(text);
                        }
                    }
                    StreamEvent::RateLimitSignal(_) => {}
                    StreamEvent::Result { text, is_error } => {
                        final_text = text;
                        final_is_error = is_error;
                    }
                })
                .await;
                (final_text, final_is_error)
            })
        } else {
            let mut stdout = stdout.expect("stdout piped at spawn");
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut raw = String::new();
                let _ = stdout.read_to_string(&mut raw).await;
                match parse_json_result(&raw) {
                    Some((text, is_error)) => (text, is_error),
                    None => (raw, true),
                }
            })
        };

        let wait_result = tokio::time::timeout(timeout, child.wait()).await;

        let status = match wait_result {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Ok(AgentRunOutcome {
                    success: false,
                    text: format!("wait failed: {e}"),
                    category: Some(ErrorCategory::Infrastructure),
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                return Ok(AgentRunOutcome {
                    success: false,
                    text: "timed out".to_string(),
                    category: Some(ErrorCategory::Transient),
                });
            }
        };

        let (out_text, out_is_error) = stdout_task.await.unwrap_or_default();

        let mut stderr_text = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            use tokio::io::AsyncReadExt;
            let _ = stderr.read_to_string(&mut stderr_text).await;
        }

        if status.success() && !out_is_error {
            return Ok(AgentRunOutcome {
                success: true,
                text: out_text,
                category: None,
            });
        }

        let category = classify_error(status.code(), &out_text, &stderr_text);

        Ok(AgentRunOutcome {
            success: false,
            text: if out_text.is_empty() { stderr_text } else { out_text },
            category: Some(category),
        })
    }

    /// Run a prompt expecting a structured (JSON) response, asking the
    /// agent to validate its output against `schema` (§4.3). The schema
    /// is passed through to the subprocess as `--json-schema`; the
    /// response is still parsed defensively since schema enforcement is
    /// the agent's responsibility, not something this process can verify
    /// on its own.
    pub async fn run_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        timeout: Duration,
        project_path: &Path,
    ) -> AppResult<Result<serde_json::Value, String>> {
        let schema_str = schema.to_string();
        let id = self.register().await;
        let result = self
            .run_inner(id, prompt, timeout, project_path, None, false, Some(&schema_str))
            .await;
        self.unregister(id).await;

        let outcome = result?;
        if !outcome.success {
            return Ok(Err(outcome.text));
        }
        match serde_json::from_str::<serde_json::Value>(&outcome.text) {
            Ok(value) => Ok(Ok(value)),
            Err(e) => Ok(Err(format!("failed to parse structured output: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_project_rejects_nonexistent_path() {
        let runner = AgentRunner::new(&OrchestratorConfig::default());
        let result = runner.set_project(Path::new("/definitely/not/a/real/path")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn set_project_accepts_existing_dir() {
        let runner = AgentRunner::new(&OrchestratorConfig::default());
        let dir = std::env::temp_dir();
        assert!(runner.set_project(&dir).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_marks_invocation_cancelled() {
        let runner = AgentRunner::new(&OrchestratorConfig::default());
        let id = runner.register().await;
        runner.cancel().await;
        assert!(runner.is_cancelled(id).await);
    }
}
