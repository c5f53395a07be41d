// NDJSON stream-json parsing and progress-callback batching (§4.3).
//
// Streaming mode emits lines of type `assistant` (content blocks),
// `rate_limit_event`, and `result`. Incremental text is batched with
// both a minimum-chars and a minimum-time threshold before being
// handed to the caller's progress callback, to avoid flooding it with
// one call per token.

use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Batched incremental assistant text.
    Progress(String),
    /// A `rate_limit_event` line was observed; carries any detail text found.
    RateLimitSignal(String),
    /// The terminal `result` line: final text and whether it reports an error.
    Result { text: String, is_error: bool },
}

struct Batcher {
    buf: String,
    last_flush: Instant,
    min_chars: usize,
    min_interval: Duration,
}

impl Batcher {
    fn new(min_chars: usize, min_interval: Duration) -> Self {
        Self {
            buf: String::new(),
            last_flush: Instant::now(),
            min_chars,
            min_interval,
        }
    }

    fn push(&mut self, text: &str) -> Option<String> {
        self.buf.push_str(text);
        if self.buf.chars().count() >= self.min_chars || self.last_flush.elapsed() >= self.min_interval {
            self.last_flush = Instant::now();
            Some(std::mem::take(&mut self.buf))
        } else {
            None
        }
    }

    fn flush(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            self.last_flush = Instant::now();
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// Read stdout line-by-line, parsing each line as a stream-json event
/// and invoking `on_event` for batched progress text, rate-limit
/// signals, and the final result.
pub async fn consume_stream<F>(
    stdout: ChildStdout,
    min_chars: usize,
    min_interval: Duration,
    mut on_event: F,
) where
    F: FnMut(StreamEvent),
{
    let reader = BufReader::new(stdout);
    let mut lines = reader.lines();
    let mut batcher = Batcher::new(min_chars, min_interval);

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(&line) else {
            continue;
        };
        let msg_type = json.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");

        match msg_type {
            "assistant" => {
                if let Some(text) = extract_assistant_text(&json) {
                    if let Some(batch) = batcher.push(&text) {
                        on_event(StreamEvent::Progress(batch));
                    }
                }
            }
            "rate_limit_event" => {
                let detail = json
                    .get("rate_limit_info")
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                on_event(StreamEvent::RateLimitSignal(detail));
            }
            "result" => {
                if let Some(batch) = batcher.flush() {
                    on_event(StreamEvent::Progress(batch));
                }
                let text = json
                    .get("result")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let is_error = json.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
                on_event(StreamEvent::Result { text, is_error });
            }
            _ => {}
        }
    }

    if let Some(batch) = batcher.flush() {
        on_event(StreamEvent::Progress(batch));
    }
}

fn extract_assistant_text(json: &serde_json::Value) -> Option<String> {
    let content = json.get("message")?.get("content")?.as_array()?;
    let mut out = String::new();
    for block in content {
        if block.get("type").and_then(|v| v.as_str()) == Some("text") {
            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Parse a single non-streaming `--output-format json` response.
pub fn parse_json_result(stdout: &str) -> Option<(String, bool)> {
    let json: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let text = json.get("result").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let is_error = json.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
    Some((text, is_error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batcher_flushes_on_char_threshold() {
        let mut batcher = Batcher::new(5, Duration::from_secs(999));
        assert!(batcher.push("ab").is_none());
        assert!(batcher.push("cdef").is_some());
    }

    #[test]
    fn batcher_flushes_on_time_threshold() {
        let mut batcher = Batcher::new(1000, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(batcher.push("x").is_some());
    }

    #[test]
    fn parses_non_streaming_result() {
        let stdout = r#"{"result": "done", "is_error": false}"#;
        let (text, is_error) = parse_json_result(stdout).unwrap();
        assert_eq!(text, "done");
        assert!(!is_error);
    }

    #[test]
    fn extracts_assistant_text_blocks() {
        let json = serde_json::json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "hello"}]}
        });
        assert_eq!(extract_assistant_text(&json), Some("hello".to_string()));
    }
}
