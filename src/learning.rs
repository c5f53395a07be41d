// Learning extraction (§4.6 step 10): turns a finished task's outcome
// into reusable `Learning` candidates — what went wrong, what pattern
// worked, what quality gate kept failing — so later task prompts can be
// primed with relevant history instead of repeating mistakes.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::models::{LearningCategory, QualityGateResult, Task};

/// A learning not yet persisted; the caller attaches `user_id` and
/// `project_name` and hands it to `LearningOps::store`.
#[derive(Debug, Clone)]
pub struct ExtractedLearning {
    pub category: LearningCategory,
    pub title: String,
    pub content: String,
    pub relevance_keywords: Vec<String>,
    pub confidence: f64,
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did",
    "will", "would", "could", "should", "may", "might", "must", "shall", "can", "need", "dare", "ought", "used",
    "to", "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "through", "during", "before", "after",
    "above", "below", "between", "under", "again", "further", "then", "once", "and", "but", "if", "or", "because",
    "until", "while", "this", "that", "these", "those", "it", "its", "they", "them", "their", "there", "here",
    "when", "where", "which", "who", "whom", "what", "how", "all", "each", "every", "both", "few", "more", "most",
    "other", "some", "such", "no", "not", "only", "own", "same", "so", "than", "too", "very", "just", "also", "now",
    "new", "first", "last",
];

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[a-zA-Z_][a-zA-Z0-9_]*\b").unwrap())
}

fn learning_markers() -> &'static [(Regex, LearningCategory)] {
    static MARKERS: OnceLock<Vec<(Regex, LearningCategory)>> = OnceLock::new();
    MARKERS.get_or_init(|| {
        vec![
            (
                Regex::new(r"(?is)(?:Note|Important|Remember|Tip|Insight):\s*(.+?)(?:\n\n|\z)").unwrap(),
                LearningCategory::BestPractice,
            ),
            (
                Regex::new(r"(?is)(?:Pattern|Approach|Solution):\s*(.+?)(?:\n\n|\z)").unwrap(),
                LearningCategory::Pattern,
            ),
            (
                Regex::new(r"(?is)(?:Warning|Caution|Pitfall):\s*(.+?)(?:\n\n|\z)").unwrap(),
                LearningCategory::Pitfall,
            ),
            (
                Regex::new(r"(?is)(?:Learned|Discovery|Found):\s*(.+?)(?:\n\n|\z)").unwrap(),
                LearningCategory::ProjectContext,
            ),
        ]
    })
}

/// Extracts whatever is worth remembering from a completed task: a
/// pitfall if it failed, explicit pattern markers and a generic
/// fallback if it succeeded, and a testing learning if quality gates
/// regressed.
pub struct LearningExtractor;

impl LearningExtractor {
    pub fn extract(
        task: &Task,
        success: bool,
        error_message: Option<&str>,
        agent_output: Option<&str>,
        files_changed: &[String],
        quality_gate: Option<&QualityGateResult>,
    ) -> Vec<ExtractedLearning> {
        let mut learnings = Vec::new();

        if !success {
            if let Some(error_message) = error_message {
                learnings.push(Self::pitfall_learning(task, error_message));
            }
        }

        if success {
            if let Some(output) = agent_output {
                let mut patterns = Self::pattern_learnings(task, output, files_changed);
                learnings.append(&mut patterns);
            }
        }

        if let Some(qg) = quality_gate {
            if qg_regressed(qg) {
                learnings.push(Self::quality_gate_learning(task, qg));
            }
        }

        learnings
    }

    fn pitfall_learning(task: &Task, error_message: &str) -> ExtractedLearning {
        let content = format!(
            "When working on '{}', encountered:\n\n{}\n\nTask context: {}",
            task.title,
            truncate(error_message, 500),
            truncate(&task.description, 300),
        );
        ExtractedLearning {
            category: LearningCategory::Pitfall,
            title: format!("Issue: {}", truncate(&task.title, 50)),
            content: content.clone(),
            relevance_keywords: extract_keywords(&format!("{error_message} {}", task.description), 10),
            confidence: 0.8,
        }
    }

    fn pattern_learnings(task: &Task, output: &str, files_changed: &[String]) -> Vec<ExtractedLearning> {
        let mut learnings = Vec::new();

        for (re, category) in learning_markers() {
            for capture in re.captures_iter(output).take(3) {
                let Some(matched) = capture.get(1) else { continue };
                let text = matched.as_str().trim();
                if text.len() <= 50 {
                    continue;
                }
                learnings.push(ExtractedLearning {
                    category: *category,
                    title: truncate_title(text, 80),
                    content: text.to_string(),
                    relevance_keywords: extract_keywords(text, 10),
                    confidence: 0.7,
                });
            }
        }

        if learnings.is_empty() && output.len() > 500 && !files_changed.is_empty() {
            let content = format!(
                "Successfully completed '{}'.\n\nFiles changed: {}\n\nApproach: {}",
                task.title,
                files_changed.iter().take(5).cloned().collect::<Vec<_>>().join(", "),
                truncate(&task.description, 300),
            );
            learnings.push(ExtractedLearning {
                category: LearningCategory::Pattern,
                title: format!("Completed: {}", truncate(&task.title, 50)),
                content,
                relevance_keywords: extract_keywords(&task.description, 10),
                confidence: 0.5,
            });
        }

        learnings
    }

    fn quality_gate_learning(task: &Task, qg: &QualityGateResult) -> ExtractedLearning {
        let mut parts = vec![format!("Quality gates failed for '{}'", task.title)];

        if qg.tests_failed > 0 {
            parts.push(format!("\nTests failed: {}/{}", qg.tests_failed, qg.tests_run));
        }
        if qg.typecheck_passed == Some(false) {
            parts.push("\nType checking failed".to_string());
        }
        if qg.lint_passed == Some(false) {
            parts.push("\nLinting failed".to_string());
        }
        if !qg.output.is_empty() {
            parts.push(format!("\nOutput:\n{}", truncate(&qg.output, 500)));
        }

        ExtractedLearning {
            category: LearningCategory::Testing,
            title: format!("QG failure: {}", truncate(&task.title, 40)),
            content: parts.join("\n"),
            relevance_keywords: extract_keywords(&task.description, 10),
            confidence: 0.9,
        }
    }
}

fn qg_regressed(qg: &QualityGateResult) -> bool {
    qg.tests_failed > 0 || qg.typecheck_passed == Some(false) || qg.lint_passed == Some(false)
}

/// Top-N stop-word-filtered identifier-like tokens, ranked by frequency.
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let stop_words: std::collections::HashSet<&str> = STOP_WORDS.iter().copied().collect();
    let mut counts: HashMap<String, usize> = HashMap::new();

    for m in word_regex().find_iter(&text.to_lowercase()) {
        let word = m.as_str();
        if word.len() > 2 && !stop_words.contains(word) {
            *counts.entry(word.to_string()).or_insert(0) += 1;
        }
    }

    let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.into_iter().take(max_keywords).map(|(word, _)| word).collect()
}

fn truncate_title(text: &str, max_len: usize) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let first_sentence = first_line.split('.').next().unwrap_or("").trim();
    let title = if !first_sentence.is_empty() && first_sentence.len() < first_line.len() {
        first_sentence
    } else {
        first_line
    };
    if title.chars().count() > max_len {
        let truncated: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    } else {
        title.to_string()
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> Task {
        Task::new(1, 0, "Add retry logic".to_string(), "Implement exponential backoff for agent calls".to_string(), 5)
    }

    #[test]
    fn extracts_pitfall_on_failure() {
        let task = sample_task();
        let learnings = LearningExtractor::extract(&task, false, Some("panic: index out of bounds"), None, &[], None);
        assert_eq!(learnings.len(), 1);
        assert_eq!(learnings[0].category, LearningCategory::Pitfall);
        assert_eq!(learnings[0].confidence, 0.8);
    }

    #[test]
    fn extracts_explicit_pattern_marker() {
        let task = sample_task();
        let output = "Pattern: Using a sliding window buffer avoids reallocating the vector on every batch push, which was the prior bottleneck.\n\n";
        let learnings = LearningExtractor::extract(&task, true, None, Some(output), &["src/lib.rs".to_string()], None);
        assert!(learnings.iter().any(|l| l.category == LearningCategory::Pattern));
    }

    #[test]
    fn falls_back_to_generic_completion_learning() {
        let task = sample_task();
        let long_output = "x".repeat(600);
        let learnings = LearningExtractor::extract(&task, true, None, Some(&long_output), &["a.rs".to_string()], None);
        assert_eq!(learnings.len(), 1);
        assert!(learnings[0].title.starts_with("Completed:"));
    }

    #[test]
    fn extracts_quality_gate_learning_on_regression() {
        let task = sample_task();
        let qg = QualityGateResult {
            tests_run: 10,
            tests_passed: 8,
            tests_failed: 2,
            typecheck_passed: Some(true),
            lint_passed: Some(true),
            output: "2 failed".to_string(),
            execution_time_ms: 100,
            regression_detected: true,
        };
        let learnings = LearningExtractor::extract(&task, true, None, None, &[], Some(&qg));
        assert_eq!(learnings.len(), 1);
        assert_eq!(learnings[0].category, LearningCategory::Testing);
    }

    #[test]
    fn no_quality_gate_learning_when_gates_pass() {
        let task = sample_task();
        let qg = QualityGateResult {
            tests_run: 10,
            tests_passed: 10,
            tests_failed: 0,
            typecheck_passed: Some(true),
            lint_passed: Some(true),
            output: String::new(),
            execution_time_ms: 100,
            regression_detected: false,
        };
        let learnings = LearningExtractor::extract(&task, true, None, None, &[], Some(&qg));
        assert!(learnings.is_empty());
    }

    #[test]
    fn keyword_extraction_filters_stop_words_and_short_tokens() {
        let keywords = extract_keywords("the mutex deadlock in async code is a common pattern", 10);
        assert!(keywords.contains(&"mutex".to_string()));
        assert!(keywords.contains(&"deadlock".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"in".to_string()));
    }
}
