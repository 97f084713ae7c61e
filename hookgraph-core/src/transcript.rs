//! Subagent transcript reader
//!
//! Subagents do not fire tool hooks of their own; their calls are recovered
//! from the JSONL transcript the host writes. Assistant records carry
//! `tool_use` blocks and the following user records carry the matching
//! `tool_result` blocks.

use crate::classify::{sanitize_input, truncate};
use crate::correlate::CompletedCall;
use crate::error::{Error, Result};
use crate::types::CallOrigin;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Error text kept from a failed result
const ERROR_LIMIT: usize = 500;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawRecord {
    timestamp: Option<String>,
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Flatten a tool_result body (string or list of text blocks) to text.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_ts(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read the tool calls a subagent made, in the order it made them.
///
/// A missing transcript is not an error: the subagent is still recorded,
/// just without calls. Lines that do not parse are skipped.
pub fn read_subagent_calls(path: &Path, session_id: &str, agent_id: &str) -> Result<Vec<CompletedCall>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), agent_id, "Subagent transcript not found");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(Error::Transcript {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        }
    };

    let mut calls: Vec<CompletedCall> = Vec::new();
    let mut open: HashMap<String, usize> = HashMap::new();
    let mut skipped = 0usize;

    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::Transcript {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RawRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        let ts = parse_ts(record.timestamp.as_deref());
        let Some(RawContent::Blocks(blocks)) = record.message.and_then(|m| m.content) else {
            continue;
        };

        for block in blocks {
            match block {
                ContentBlock::ToolUse { id, name, input } => {
                    open.insert(id.clone(), calls.len());
                    calls.push(CompletedCall {
                        call_id: format!("{}:{}:{}", session_id, agent_id, id),
                        session_id: session_id.to_string(),
                        tool_name: name,
                        tool_use_id: Some(id),
                        input: sanitize_input(&input),
                        response: Value::Null,
                        started_at: ts,
                        ended_at: None,
                        duration_ms: None,
                        success: None,
                        error: None,
                        origin: CallOrigin::Transcript,
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let Some(idx) = open.remove(&tool_use_id) else {
                        continue;
                    };
                    let call = &mut calls[idx];
                    let text = result_text(&content);
                    call.ended_at = ts;
                    call.duration_ms = match (call.started_at, ts) {
                        (Some(start), Some(end)) => {
                            Some((end - start).num_milliseconds().max(0))
                        }
                        _ => None,
                    };
                    call.success = Some(!is_error);
                    if is_error {
                        call.error = Some(truncate(&text, ERROR_LIMIT));
                    }
                    call.response = Value::String(text);
                }
                ContentBlock::Unknown => {}
            }
        }
    }

    if skipped > 0 {
        tracing::debug!(path = %path.display(), skipped, "Skipped unparseable transcript lines");
    }
    Ok(calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_transcript(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn test_pairs_tool_use_with_result() {
        let file = write_transcript(&[
            r#"{"type":"assistant","timestamp":"2025-01-01T00:00:00Z","message":{"content":[{"type":"text","text":"looking"},{"type":"tool_use","id":"t1","name":"Grep","input":{"pattern":"fn main","api_key":"x"}}]}}"#,
            r#"{"type":"user","timestamp":"2025-01-01T00:00:02Z","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"src/main.rs:1:fn main()"}]}}"#,
            r#"{"type":"assistant","timestamp":"2025-01-01T00:00:03Z","message":{"content":[{"type":"tool_use","id":"t2","name":"Read","input":{"file_path":"/nope"}}]}}"#,
            r#"{"type":"user","timestamp":"2025-01-01T00:00:04Z","message":{"content":[{"type":"tool_result","tool_use_id":"t2","is_error":true,"content":[{"type":"text","text":"File does not exist"}]}]}}"#,
            "not json at all",
        ]);

        let calls = read_subagent_calls(file.path(), "s1", "a1").unwrap();
        assert_eq!(calls.len(), 2);

        assert_eq!(calls[0].tool_name, "Grep");
        assert_eq!(calls[0].duration_ms, Some(2000));
        assert_eq!(calls[0].success, Some(true));
        assert_eq!(calls[0].input["api_key"], "[REDACTED]");
        assert_eq!(calls[0].origin, CallOrigin::Transcript);

        assert_eq!(calls[1].success, Some(false));
        assert_eq!(calls[1].error.as_deref(), Some("File does not exist"));
    }

    #[test]
    fn test_unanswered_call_kept_unmeasured() {
        let file = write_transcript(&[
            r#"{"timestamp":"2025-01-01T00:00:00Z","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}}]}}"#,
        ]);
        let calls = read_subagent_calls(file.path(), "s1", "a1").unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].success, None);
        assert_eq!(calls[0].duration_ms, None);
    }

    #[test]
    fn test_missing_transcript_is_empty() {
        let calls =
            read_subagent_calls(Path::new("/definitely/not/here.jsonl"), "s1", "a1").unwrap();
        assert!(calls.is_empty());
    }
}
