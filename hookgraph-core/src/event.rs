//! Inbound hook events
//!
//! The host delivers one JSON object per hook call. It is parsed here, once,
//! into [`HookEvent`]; nothing past this boundary sees a loosely-typed map.
//! Field names are read in snake_case first, then camelCase.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// SessionStart payload
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStart {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub cwd: Option<String>,
    pub source: Option<String>,
}

/// SessionEnd payload
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEnd {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Prompt submission payload
#[derive(Debug, Clone, PartialEq)]
pub struct PromptSubmit {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub cwd: Option<String>,
}

/// "Before" half of a tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPre {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    pub tool_input: Value,
    pub cwd: Option<String>,
}

/// "After" half of a tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPost {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    pub tool_input: Value,
    pub tool_response: Value,
    /// Host-reported success flag, when present
    pub success: Option<bool>,
    /// Host-reported error text, when present
    pub error: Option<String>,
    pub cwd: Option<String>,
}

/// Subagent completion payload
#[derive(Debug, Clone, PartialEq)]
pub struct SubagentStop {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub agent_type: Option<String>,
    pub transcript_path: Option<PathBuf>,
}

/// One inbound event, by kind
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    SessionStart(SessionStart),
    SessionEnd(SessionEnd),
    PromptSubmit(PromptSubmit),
    ToolPre(ToolPre),
    ToolPost(ToolPost),
    SubagentStop(SubagentStop),
}

impl HookEvent {
    /// Parse a raw hook payload, arriving `now` if it carries no timestamp.
    pub fn parse(raw: &str, now: DateTime<Utc>) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| Error::MalformedEvent(format!("invalid JSON: {}", e)))?;
        Self::from_value(&value, now)
    }

    /// Parse an already-decoded payload.
    pub fn from_value(v: &Value, now: DateTime<Utc>) -> Result<Self> {
        if !v.is_object() {
            return Err(Error::MalformedEvent("payload is not an object".into()));
        }

        let kind = required(v, "hook_event_name")?;
        let session_id = required(v, "session_id")?;
        let timestamp = get_str(v, "timestamp")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        let cwd = get_str(v, "cwd");

        let event = match kind.as_str() {
            "SessionStart" => HookEvent::SessionStart(SessionStart {
                session_id,
                timestamp,
                cwd,
                source: get_str(v, "source"),
            }),
            "SessionEnd" => HookEvent::SessionEnd(SessionEnd {
                session_id,
                timestamp,
                reason: get_str(v, "reason"),
            }),
            "UserPromptSubmit" | "PromptSubmit" => HookEvent::PromptSubmit(PromptSubmit {
                session_id,
                timestamp,
                prompt: get_raw_str(v, "prompt")
                    .ok_or_else(|| missing("prompt", &kind))?,
                cwd,
            }),
            "PreToolUse" | "ToolPre" => HookEvent::ToolPre(ToolPre {
                session_id,
                timestamp,
                tool_name: required(v, "tool_name")?,
                tool_use_id: get_str(v, "tool_use_id"),
                tool_input: get_value(v, "tool_input"),
                cwd,
            }),
            "PostToolUse" | "ToolPost" => {
                let response = get_value(v, "tool_response");
                HookEvent::ToolPost(ToolPost {
                    session_id,
                    timestamp,
                    tool_name: required(v, "tool_name")?,
                    tool_use_id: get_str(v, "tool_use_id"),
                    tool_input: get_value(v, "tool_input"),
                    success: get_bool(v, "success"),
                    error: get_str(v, "error"),
                    tool_response: response,
                    cwd,
                })
            }
            "SubagentStop" => {
                let transcript_path =
                    get_str(v, "agent_transcript_path").map(PathBuf::from);
                let agent_id = get_str(v, "agent_id")
                    .or_else(|| transcript_path.as_deref().and_then(agent_id_from_path))
                    .ok_or_else(|| missing("agent_id", &kind))?;
                HookEvent::SubagentStop(SubagentStop {
                    session_id,
                    timestamp,
                    agent_id,
                    agent_type: get_str(v, "agent_type"),
                    transcript_path,
                })
            }
            other => {
                return Err(Error::MalformedEvent(format!(
                    "unknown hook_event_name: {}",
                    other
                )))
            }
        };

        Ok(event)
    }

    pub fn session_id(&self) -> &str {
        match self {
            HookEvent::SessionStart(e) => &e.session_id,
            HookEvent::SessionEnd(e) => &e.session_id,
            HookEvent::PromptSubmit(e) => &e.session_id,
            HookEvent::ToolPre(e) => &e.session_id,
            HookEvent::ToolPost(e) => &e.session_id,
            HookEvent::SubagentStop(e) => &e.session_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HookEvent::SessionStart(e) => e.timestamp,
            HookEvent::SessionEnd(e) => e.timestamp,
            HookEvent::PromptSubmit(e) => e.timestamp,
            HookEvent::ToolPre(e) => e.timestamp,
            HookEvent::ToolPost(e) => e.timestamp,
            HookEvent::SubagentStop(e) => e.timestamp,
        }
    }

    /// Working directory, for events that carry one
    pub fn cwd(&self) -> Option<&str> {
        match self {
            HookEvent::SessionStart(e) => e.cwd.as_deref(),
            HookEvent::PromptSubmit(e) => e.cwd.as_deref(),
            HookEvent::ToolPre(e) => e.cwd.as_deref(),
            HookEvent::ToolPost(e) => e.cwd.as_deref(),
            HookEvent::SessionEnd(_) | HookEvent::SubagentStop(_) => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            HookEvent::SessionStart(_) => "SessionStart",
            HookEvent::SessionEnd(_) => "SessionEnd",
            HookEvent::PromptSubmit(_) => "PromptSubmit",
            HookEvent::ToolPre(_) => "ToolPre",
            HookEvent::ToolPost(_) => "ToolPost",
            HookEvent::SubagentStop(_) => "SubagentStop",
        }
    }
}

/// `agent-abc123.jsonl` -> `abc123`
pub fn agent_id_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let id = stem.strip_prefix("agent-").unwrap_or(stem);
    (!id.is_empty()).then(|| id.to_string())
}

fn missing(field: &str, kind: &str) -> Error {
    Error::MalformedEvent(format!("{} event missing {}", kind, field))
}

fn required(v: &Value, key: &str) -> Result<String> {
    get_str(v, key).ok_or_else(|| Error::MalformedEvent(format!("missing {}", key)))
}

fn lookup<'a>(v: &'a Value, snake_key: &str) -> Option<&'a Value> {
    v.get(snake_key)
        .or_else(|| v.get(snake_to_camel(snake_key).as_str()))
        .filter(|x| !x.is_null())
}

/// Non-empty, trimmed string field
fn get_str(v: &Value, snake_key: &str) -> Option<String> {
    lookup(v, snake_key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// String field kept verbatim (may be empty)
fn get_raw_str(v: &Value, snake_key: &str) -> Option<String> {
    lookup(v, snake_key).and_then(Value::as_str).map(str::to_string)
}

fn get_bool(v: &Value, snake_key: &str) -> Option<bool> {
    lookup(v, snake_key).and_then(Value::as_bool)
}

fn get_value(v: &Value, snake_key: &str) -> Value {
    lookup(v, snake_key).cloned().unwrap_or(Value::Null)
}

fn snake_to_camel(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut capitalize_next = false;
    for ch in s.chars() {
        if ch == '_' {
            capitalize_next = true;
        } else if capitalize_next {
            result.extend(ch.to_uppercase());
            capitalize_next = false;
        } else {
            result.push(ch);
        }
    }
    result
}
