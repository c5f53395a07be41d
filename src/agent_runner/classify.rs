// Text-based error classification from subprocess exit code and output,
// grounded on the original CLI runner's `classify_error` (§4.3, §7).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Worth retrying: timeout, crash, transient network blip.
    Transient,
    /// Not worth retrying: bad prompt, auth failure, permission denial.
    Permanent,
    /// CLI missing or environment broken; not the agent's fault.
    Infrastructure,
    /// Subscription/usage cap hit; activates the cooldown gate.
    RateLimited,
}

const SUBSCRIPTION_PATTERNS: &[&str] = &[
    "usage limit",
    "daily limit",
    "capacity",
    "overloaded",
    "too many requests",
    "try again later",
    "quota exceeded",
    "hourly limit",
    "subscription",
];

/// Classify a failed invocation from its exit code and combined stdout/stderr.
pub fn classify_error(exit_code: Option<i32>, stdout: &str, stderr: &str) -> ErrorCategory {
    let combined = format!("{stdout}{stderr}").to_lowercase();

    if combined.contains("prompt is too long") || combined.contains("conversation too long") {
        return ErrorCategory::Permanent;
    }
    if combined.contains("invalid api key") || combined.contains("authentication") {
        return ErrorCategory::Permanent;
    }
    if combined.contains("permission denied") {
        return ErrorCategory::Permanent;
    }

    if exit_code == Some(127) {
        return ErrorCategory::Infrastructure;
    }

    if combined.contains("rate limit") || combined.contains("429") {
        if SUBSCRIPTION_PATTERNS.iter().any(|p| combined.contains(p)) {
            return ErrorCategory::RateLimited;
        }
        return ErrorCategory::Transient;
    }

    if combined.contains("timeout") || combined.contains("timed out") {
        return ErrorCategory::Transient;
    }
    if combined.contains("connection") && (combined.contains("reset") || combined.contains("refused")) {
        return ErrorCategory::Transient;
    }
    if combined.contains("server error") || combined.contains("500") || combined.contains("502") {
        return ErrorCategory::Transient;
    }
    if matches!(exit_code, Some(-9) | Some(-15) | Some(137) | Some(143)) {
        return ErrorCategory::Transient;
    }

    if exit_code != Some(0) && stderr.trim().is_empty() {
        return ErrorCategory::Transient;
    }

    ErrorCategory::Permanent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_language_is_rate_limited() {
        let cat = classify_error(Some(1), "", "Error: daily limit exceeded, try again later");
        assert_eq!(cat, ErrorCategory::RateLimited);
    }

    #[test]
    fn bare_429_without_subscription_wording_is_transient() {
        let cat = classify_error(Some(1), "", "429 rate limit hit");
        assert_eq!(cat, ErrorCategory::Transient);
    }

    #[test]
    fn missing_binary_is_infrastructure() {
        let cat = classify_error(Some(127), "", "command not found");
        assert_eq!(cat, ErrorCategory::Infrastructure);
    }

    #[test]
    fn auth_failure_is_permanent() {
        let cat = classify_error(Some(1), "", "Authentication failed: invalid api key");
        assert_eq!(cat, ErrorCategory::Permanent);
    }

    #[test]
    fn sigkill_exit_code_is_transient() {
        let cat = classify_error(Some(137), "", "");
        assert_eq!(cat, ErrorCategory::Transient);
    }

    #[test]
    fn clean_failure_with_no_stderr_is_transient() {
        let cat = classify_error(Some(1), "", "");
        assert_eq!(cat, ErrorCategory::Transient);
    }

    #[test]
    fn nonempty_unmatched_stderr_is_permanent() {
        let cat = classify_error(Some(1), "", "some weird custom tool error");
        assert_eq!(cat, ErrorCategory::Permanent);
    }
}
