// Quality gate runner: toolchain detection, subprocess execution with
// timeouts, a static security scan, and baseline-aware regression
// comparison (§4.7).

use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::models::QualityGateResult;

const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"\bos\.system\s*\(", "os.system() call — use subprocess with argument list instead"),
    (r"\bos\.popen\s*\(", "os.popen() call — use subprocess with argument list instead"),
    (r"subprocess\.\w+\([^)]*shell\s*=\s*True", "subprocess with shell=True — use argument list"),
    (r"\beval\s*\(", "eval() call — potential code injection"),
    (r"\bexec\s*\(", "exec() call — potential code injection"),
    (r"__import__\s*\(", "__import__() call — suspicious dynamic import"),
    (
        r#"(?:API_KEY|SECRET|PASSWORD|TOKEN)\s*=\s*["'][^"']{8,}["']"#,
        "possible hardcoded secret/API key",
    ),
    (
        r#"requests\.(?:get|post|put|delete)\s*\(\s*["']https?://\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}"#,
        "HTTP request to raw IP address — possible data exfiltration",
    ),
    (r"\bpickle\.loads?\s*\(", "pickle.load() — deserializing untrusted data is dangerous"),
];

const SKIP_DIRS: &[&str] = &["venv", ".venv", "__pycache__", ".git", "node_modules", "target"];

pub struct QualityGateRunner {
    test_timeout: Duration,
    typecheck_timeout: Duration,
    lint_timeout: Duration,
}

impl QualityGateRunner {
    pub fn new(test_timeout: Duration, typecheck_timeout: Duration, lint_timeout: Duration) -> Self {
        Self {
            test_timeout,
            typecheck_timeout,
            lint_timeout,
        }
    }

    /// Static scan of project source for known-dangerous patterns.
    /// Returns `"path:line: description"` findings, empty if clean.
    pub fn security_scan(&self, project_path: &Path) -> Vec<String> {
        let patterns: Vec<(regex::Regex, &str)> = DANGEROUS_PATTERNS
            .iter()
            .filter_map(|(pattern, desc)| regex::Regex::new(pattern).ok().map(|re| (re, *desc)))
            .collect();

        let mut findings = Vec::new();
        for entry in walk_source_files(project_path) {
            let Ok(content) = std::fs::read_to_string(&entry) else {
                continue;
            };
            let relative = entry.strip_prefix(project_path).unwrap_or(&entry);
            for (line_num, line) in content.lines().enumerate() {
                for (re, desc) in &patterns {
                    if re.is_match(line) {
                        findings.push(format!("{}:{}: {}", relative.display(), line_num + 1, desc));
                    }
                }
            }
        }
        findings
    }

    /// Pre-task snapshot used for regression comparison (§4.7): tests only.
    pub async fn snapshot_baseline(&self, project_path: &Path) -> QualityGateResult {
        self.run(project_path, true, false, false, None).await
    }

    pub async fn run(
        &self,
        project_path: &Path,
        run_tests: bool,
        run_typecheck: bool,
        run_lint: bool,
        baseline: Option<&QualityGateResult>,
    ) -> QualityGateResult {
        let start = Instant::now();
        let mut output_sections = Vec::new();

        let test_outcome = if run_tests {
            self.run_tests(project_path).await
        } else {
            None
        };
        let typecheck_outcome = if run_typecheck {
            self.run_generic(project_path, detect_typecheck_command, self.typecheck_timeout).await
        } else {
            None
        };
        let lint_outcome = if run_lint {
            self.run_generic(project_path, detect_lint_command, self.lint_timeout).await
        } else {
            None
        };

        let (tests_run, tests_run_passed_count, mut tests_failed) =
            test_outcome.as_ref().map(|t| (t.total, t.passed_count, t.failed_count)).unwrap_or((0, 0, 0));
        let typecheck_passed = typecheck_outcome.as_ref().map(|t| t.passed);
        let lint_passed = lint_outcome.as_ref().map(|t| t.passed);

        if let Some(t) = &test_outcome {
            output_sections.push(format!("[tests]\n{}", t.output));
        }
        if let Some(t) = &typecheck_outcome {
            output_sections.push(format!("[typecheck]\n{}", t.output));
        }
        if let Some(t) = &lint_outcome {
            output_sections.push(format!("[lint]\n{}", t.output));
        }

        // Baseline comparison: pre-existing failures don't block a task,
        // only failures introduced since the snapshot do (§4.7).
        let mut regression_detected = false;
        if let Some(baseline) = baseline {
            if test_outcome.is_some() {
                let new_failures = tests_failed - baseline.tests_failed;
                if new_failures <= 0 {
                    tests_failed = 0;
                } else {
                    regression_detected = true;
                    tests_failed = new_failures;
                }
            }
        }

        QualityGateResult {
            tests_run,
            tests_passed: tests_run_passed_count,
            tests_failed,
            typecheck_passed,
            lint_passed,
            output: output_sections.join("\n\n"),
            execution_time_ms: start.elapsed().as_millis() as i64,
            regression_detected,
        }
    }

    async fn run_tests(&self, project_path: &Path) -> Option<TestOutcome> {
        let cmd = detect_test_command(project_path)?;
        let (passed, output) = run_command(&cmd, project_path, self.test_timeout).await?;
        let (total, passed_count, failed_count) = parse_test_counts(&output, &cmd[0]);
        Some(TestOutcome {
            passed,
            total,
            passed_count,
            failed_count,
            output: tail(&output, 2000),
        })
    }

    async fn run_generic(
        &self,
        project_path: &Path,
        detect: fn(&Path) -> Option<Vec<String>>,
        timeout: Duration,
    ) -> Option<GenericOutcome> {
        let cmd = detect(project_path)?;
        let (passed, output) = run_command(&cmd, project_path, timeout).await?;
        Some(GenericOutcome {
            passed,
            output: tail(&output, 1500),
        })
    }
}

struct TestOutcome {
    passed: bool,
    total: i64,
    passed_count: i64,
    failed_count: i64,
    output: String,
}

struct GenericOutcome {
    passed: bool,
    output: String,
}

async fn run_command(cmd: &[String], cwd: &Path, timeout: Duration) -> Option<(bool, String)> {
    let mut command = Command::new(&cmd[0]);
    command.args(&cmd[1..]).current_dir(cwd);
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    let child = command.spawn().ok()?;
    let result = tokio::time::timeout(timeout, child.wait_with_output()).await;

    match result {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            Some((output.status.success(), combined))
        }
        Ok(Err(_)) => None,
        Err(_) => Some((false, format!("timeout exceeded ({}s)", timeout.as_secs()))),
    }
}

fn tail(s: &str, max_chars: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_chars {
        s.to_string()
    } else {
        chars[chars.len() - max_chars..].iter().collect()
    }
}

fn walk_source_files(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if SKIP_DIRS.contains(&name) {
                        continue;
                    }
                }
                stack.push(path);
            } else if matches!(path.extension().and_then(|e| e.to_str()), Some("py" | "rs" | "js" | "ts")) {
                out.push(path);
            }
        }
    }
    out
}

fn detect_test_command(project_path: &Path) -> Option<Vec<String>> {
    if project_path.join("Cargo.toml").exists() {
        return Some(vec!["cargo".into(), "test".into()]);
    }
    if project_path.join("pytest.ini").exists()
        || project_path.join("pyproject.toml").exists()
        || project_path.join("setup.py").exists()
        || project_path.join("tests").is_dir()
    {
        return Some(vec!["python".into(), "-m".into(), "pytest".into(), "-v".into(), "--tb=short".into()]);
    }
    if project_path.join("package.json").exists() {
        return Some(vec!["npm".into(), "test".into()]);
    }
    if project_path.join("go.mod").exists() {
        return Some(vec!["go".into(), "test".into(), "./...".into()]);
    }
    None
}

fn detect_typecheck_command(project_path: &Path) -> Option<Vec<String>> {
    if project_path.join("Cargo.toml").exists() {
        return Some(vec!["cargo".into(), "check".into()]);
    }
    if project_path.join("tsconfig.json").exists() {
        return Some(vec!["npx".into(), "tsc".into(), "--noEmit".into()]);
    }
    if project_path.join("mypy.ini").exists() {
        return Some(vec!["python".into(), "-m".into(), "mypy".into(), ".".into()]);
    }
    None
}

fn detect_lint_command(project_path: &Path) -> Option<Vec<String>> {
    if project_path.join("Cargo.toml").exists() {
        return Some(vec!["cargo".into(), "clippy".into()]);
    }
    if project_path.join("ruff.toml").exists() {
        return Some(vec!["python".into(), "-m".into(), "ruff".into(), "check".into(), ".".into()]);
    }
    if project_path.join(".eslintrc.json").exists() {
        return Some(vec!["npx".into(), "eslint".into(), ".".into()]);
    }
    None
}

fn parse_test_counts(output: &str, runner: &str) -> (i64, i64, i64) {
    let num_after = |label: &str| -> i64 {
        regex::Regex::new(&format!(r"(\d+)\s+{}", label))
            .ok()
            .and_then(|re| re.captures(output))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };

    if runner == "cargo" || runner == "python" {
        let passed = num_after("passed");
        let mut failed = num_after("failed");
        if runner == "python" {
            failed += num_after("error");
        }
        (passed + failed, passed, failed)
    } else if runner == "npm" {
        let passed = regex::Regex::new(r"Tests:\s*(\d+) passed")
            .ok()
            .and_then(|re| re.captures(output))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let failed = regex::Regex::new(r"Tests:\s*(\d+) failed")
            .ok()
            .and_then(|re| re.captures(output))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        (passed + failed, passed, failed)
    } else if runner == "go" {
        let passed = output.matches("--- PASS:").count() as i64;
        let failed = output.matches("--- FAIL:").count() as i64;
        (passed + failed, passed, failed)
    } else {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_scan_flags_eval() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.py"), "result = eval(user_input)\n").unwrap();
        let runner = QualityGateRunner::new(Duration::from_secs(1), Duration::from_secs(1), Duration::from_secs(1));
        let findings = runner.security_scan(dir.path());
        assert_eq!(findings.len(), 1);
        assert!(findings[0].contains("eval"));
    }

    #[test]
    fn security_scan_is_clean_on_safe_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.py"), "x = 1 + 1\n").unwrap();
        let runner = QualityGateRunner::new(Duration::from_secs(1), Duration::from_secs(1), Duration::from_secs(1));
        let findings = runner.security_scan(dir.path());
        assert!(findings.is_empty());
    }

    #[test]
    fn parses_pytest_counts() {
        let (total, passed, failed) = parse_test_counts("5 passed, 2 failed in 1.2s", "python");
        assert_eq!((total, passed, failed), (7, 5, 2));
    }

    #[test]
    fn parses_cargo_test_counts() {
        let (total, passed, failed) = parse_test_counts("test result: ok. 5 passed; 0 failed", "cargo");
        assert_eq!((total, passed, failed), (5, 5, 0));
    }

    #[test]
    fn detects_cargo_test_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(detect_test_command(dir.path()), Some(vec!["cargo".to_string(), "test".to_string()]));
    }
}
