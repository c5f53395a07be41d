// Subprocess construction for one agent invocation (§4.3, §6.4).

use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::error::{AgentError, AppError, AppResult};

pub struct SpawnOptions<'a> {
    pub binary: &'a str,
    pub working_dir: &'a Path,
    pub model: Option<&'a str>,
    pub stream: bool,
    pub schema: Option<&'a str>,
}

/// Spawn `<agent_path> -p --output-format json` (or
/// `stream-json --verbose` when streaming), stdin piped for the prompt.
/// When `schema` is set, appends `--json-schema <schema>` so the agent
/// attempts schema-validated structured output before any free-text
/// fallback is needed.
pub fn spawn(opts: SpawnOptions<'_>) -> AppResult<Child> {
    let mut cmd = Command::new(opts.binary);

    let mut args: Vec<&str> = vec!["-p", "--permission-mode", "bypassPermissions"];
    if opts.stream {
        args.extend(["--input-format", "stream-json", "--output-format", "stream-json", "--verbose"]);
    } else {
        args.extend(["--output-format", "json"]);
    }
    cmd.args(&args);

    if let Some(model) = opts.model {
        cmd.arg("--model").arg(model);
    }

    if let Some(schema) = opts.schema {
        cmd.arg("--json-schema").arg(schema);
    }

    cmd.current_dir(opts.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    cmd.spawn()
        .map_err(|e| AppError::Agent(AgentError::SpawnFailed(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_missing_binary_reports_spawn_failed() {
        let opts = SpawnOptions {
            binary: "/nonexistent/definitely-not-a-real-binary",
            working_dir: Path::new("."),
            model: None,
            stream: false,
            schema: None,
        };
        let result = spawn(opts);
        assert!(result.is_err());
    }
}
