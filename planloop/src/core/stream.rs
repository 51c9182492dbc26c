//! Decoding of the agent's `stream-json` output.
//!
//! Every stdout line becomes zero or more [`AgentEvent`]s. Lines that are not
//! JSON, or JSON of a shape we do not know, decode to [`AgentEvent::Skip`];
//! decoding never fails.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

static CONFIDENCE_TEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)confidence\s*(?:level|score)?\s*[:=]\s*\**\s*(\d+(?:\.\d+)?)\s*(%)?")
        .expect("confidence regex")
});

const TOOL_SUMMARY_LIMIT: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceSource {
    /// `structured_output.confidence` or a top-level `confidence` field.
    Structured,
    /// A `confidence: NN%` phrase in the result text. Best effort only.
    TextHeuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Confidence {
    /// Normalized to `0.0..=1.0`.
    pub value: f64,
    pub source: ConfidenceSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub is_error: bool,
    pub result: String,
    pub session_id: Option<String>,
    pub confidence: Option<Confidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolCall {
        name: String,
        summary: Option<String>,
    },
    ToolResult {
        is_error: bool,
    },
    TextDelta {
        text: String,
    },
    /// Context occupied by the conversation after the latest turn.
    UsageUpdate {
        context_tokens: u64,
    },
    Completion(Completion),
    Skip,
}

/// Decode one line of agent output.
pub fn classify_line(line: &str) -> Vec<AgentEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return vec![AgentEvent::Skip];
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return vec![AgentEvent::Skip];
    };
    let events = match value.get("type").and_then(Value::as_str) {
        Some("assistant") => assistant_events(&value),
        Some("user") => tool_result_events(&value),
        Some("stream_event") => stream_delta(&value).into_iter().collect(),
        Some("result") => vec![AgentEvent::Completion(completion(&value))],
        _ => Vec::new(),
    };
    if events.is_empty() {
        vec![AgentEvent::Skip]
    } else {
        events
    }
}

fn content_blocks(value: &Value) -> &[Value] {
    value
        .pointer("/message/content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn assistant_events(value: &Value) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    for block in content_blocks(value) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str)
                    && !text.is_empty()
                {
                    events.push(AgentEvent::TextDelta {
                        text: text.to_string(),
                    });
                }
            }
            Some("tool_use") => events.push(AgentEvent::ToolCall {
                name: block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                summary: block.get("input").and_then(tool_summary),
            }),
            _ => {}
        }
    }
    if let Some(usage) = value.pointer("/message/usage")
        && let Some(context_tokens) = context_tokens(usage)
    {
        events.push(AgentEvent::UsageUpdate { context_tokens });
    }
    events
}

fn tool_result_events(value: &Value) -> Vec<AgentEvent> {
    content_blocks(value)
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| AgentEvent::ToolResult {
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
        .collect()
}

fn stream_delta(value: &Value) -> Option<AgentEvent> {
    let delta = value.pointer("/event/delta")?;
    if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
        return None;
    }
    let text = delta.get("text").and_then(Value::as_str)?;
    (!text.is_empty()).then(|| AgentEvent::TextDelta {
        text: text.to_string(),
    })
}

/// Input plus cached and generated tokens of one turn.
fn context_tokens(usage: &Value) -> Option<u64> {
    let fields = [
        "input_tokens",
        "cache_creation_input_tokens",
        "cache_read_input_tokens",
        "output_tokens",
    ];
    let mut total = 0u64;
    let mut seen = false;
    for field in fields {
        if let Some(n) = usage.get(field).and_then(Value::as_u64) {
            total = total.saturating_add(n);
            seen = true;
        }
    }
    seen.then_some(total)
}

fn tool_summary(input: &Value) -> Option<String> {
    let raw = ["command", "file_path", "path", "pattern", "url", "description"]
        .iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))?;
    let first_line = raw.lines().next().unwrap_or_default();
    if first_line.chars().count() > TOOL_SUMMARY_LIMIT {
        let cut: String = first_line.chars().take(TOOL_SUMMARY_LIMIT).collect();
        Some(format!("{cut}…"))
    } else {
        Some(first_line.to_string())
    }
}

fn completion(value: &Value) -> Completion {
    let result = value
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || value
            .get("subtype")
            .and_then(Value::as_str)
            .is_some_and(|s| s.starts_with("error"));
    let confidence = structured_confidence(value)
        .map(|value| Confidence {
            value,
            source: ConfidenceSource::Structured,
        })
        .or_else(|| {
            text_confidence(&result).map(|value| Confidence {
                value,
                source: ConfidenceSource::TextHeuristic,
            })
        });
    Completion {
        is_error,
        session_id: value
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        result,
        confidence,
    }
}

fn structured_confidence(value: &Value) -> Option<f64> {
    let from_structured = match value.get("structured_output") {
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|parsed| parsed.get("confidence").and_then(Value::as_f64)),
        Some(structured) => structured.get("confidence").and_then(Value::as_f64),
        None => None,
    };
    from_structured
        .or_else(|| value.get("confidence").and_then(Value::as_f64))
        .map(|raw| normalize_confidence(raw, false))
}

fn text_confidence(text: &str) -> Option<f64> {
    let caps = CONFIDENCE_TEXT_RE.captures_iter(text).last()?;
    let raw: f64 = caps[1].parse().ok()?;
    Some(normalize_confidence(raw, caps.get(2).is_some()))
}

/// Values of 2 and up (or written with `%`) are percentages; anything
/// between 1 and 2 is an overshoot of the unit scale.
fn normalize_confidence(raw: f64, percent: bool) -> f64 {
    let value = if percent || raw >= 2.0 { raw / 100.0 } else { raw };
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_and_unknown_lines_skip() {
        assert_eq!(classify_line("plain text"), vec![AgentEvent::Skip]);
        assert_eq!(classify_line("{not json"), vec![AgentEvent::Skip]);
        assert_eq!(
            classify_line(r#"{"type":"system","subtype":"init"}"#),
            vec![AgentEvent::Skip]
        );
        assert_eq!(classify_line(""), vec![AgentEvent::Skip]);
    }

    #[test]
    fn assistant_message_yields_text_tools_and_usage() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"text","text":"Working on it"},
            {"type":"tool_use","name":"Bash","input":{"command":"cargo test\nsecond line"}}
        ],"usage":{"input_tokens":10,"cache_read_input_tokens":1000,"output_tokens":5}}}"#
            .replace('\n', "");
        let events = classify_line(&line);
        assert_eq!(
            events,
            vec![
                AgentEvent::TextDelta {
                    text: "Working on it".to_string()
                },
                AgentEvent::ToolCall {
                    name: "Bash".to_string(),
                    summary: Some("cargo test".to_string())
                },
                AgentEvent::UsageUpdate {
                    context_tokens: 1015
                },
            ]
        );
    }

    #[test]
    fn tool_results_and_partial_deltas() {
        let result =
            r#"{"type":"user","message":{"content":[{"type":"tool_result","is_error":true}]}}"#;
        assert_eq!(
            classify_line(result),
            vec![AgentEvent::ToolResult { is_error: true }]
        );
        let delta = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}}"#;
        assert_eq!(
            classify_line(delta),
            vec![AgentEvent::TextDelta {
                text: "Hel".to_string()
            }]
        );
    }

    #[test]
    fn completion_prefers_structured_confidence() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"result":"confidence: 20%","session_id":"abc","structured_output":{"confidence":0.9}}"#;
        let events = classify_line(line);
        let [AgentEvent::Completion(done)] = events.as_slice() else {
            panic!("expected completion");
        };
        assert_eq!(done.session_id.as_deref(), Some("abc"));
        assert_eq!(
            done.confidence,
            Some(Confidence {
                value: 0.9,
                source: ConfidenceSource::Structured
            })
        );
    }

    #[test]
    fn completion_confidence_fallbacks() {
        let stringified = r#"{"type":"result","result":"ok","structured_output":"{\"confidence\": 75}"}"#;
        let events = classify_line(stringified);
        let [AgentEvent::Completion(done)] = events.as_slice() else {
            panic!("expected completion");
        };
        assert_eq!(done.confidence.map(|c| c.value), Some(0.75));

        let text = r#"{"type":"result","result":"All good.\nConfidence: **65%**"}"#;
        let events = classify_line(text);
        let [AgentEvent::Completion(done)] = events.as_slice() else {
            panic!("expected completion");
        };
        assert_eq!(
            done.confidence,
            Some(Confidence {
                value: 0.65,
                source: ConfidenceSource::TextHeuristic
            })
        );

        let none = r#"{"type":"result","subtype":"error_max_turns","result":""}"#;
        let events = classify_line(none);
        let [AgentEvent::Completion(done)] = events.as_slice() else {
            panic!("expected completion");
        };
        assert!(done.is_error);
        assert_eq!(done.confidence, None);
    }

    #[test]
    fn oversized_usage_saturates() {
        let line = format!(
            r#"{{"type":"assistant","message":{{"content":[],"usage":{{"input_tokens":{},"output_tokens":10}}}}}}"#,
            u64::MAX
        );
        assert_eq!(
            classify_line(&line),
            vec![AgentEvent::UsageUpdate {
                context_tokens: u64::MAX
            }]
        );
    }

    #[test]
    fn confidence_just_above_one_is_not_a_percentage() {
        let text = r#"{"type":"result","result":"confidence: 1.5"}"#;
        let events = classify_line(text);
        let [AgentEvent::Completion(done)] = events.as_slice() else {
            panic!("expected completion");
        };
        assert_eq!(done.confidence.map(|c| c.value), Some(1.0));

        let percent = r#"{"type":"result","result":"confidence: 1.5%"}"#;
        let events = classify_line(percent);
        let [AgentEvent::Completion(done)] = events.as_slice() else {
            panic!("expected completion");
        };
        assert_eq!(done.confidence.map(|c| c.value), Some(0.015));
    }
}
