//! Core domain types for hookgraph
//!
//! These types describe what the durable log stores and what the graph
//! projection is built from.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One run of the coding-agent host |
//! | **Prompt** | One human submission within a session |
//! | **PendingCall** | The "before" half of a tool invocation, waiting for its "after" half |
//! | **ToolCall** | A completed (or orphaned) tool invocation |
//! | **Task** | Consecutive prompts and tool calls believed to be one unit of work |
//! | **ErrorInstance** | A failed tool call, classified and signature-normalized |
//! | **Solution** | A reusable fix pattern keyed by error signature and tool sequence |
//! | **Natural key** | Deterministic id used for idempotent graph upserts |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================
// Classification enums
// ============================================

/// What a prompt asks for, by keyword heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Implement,
    Debug,
    Refactor,
    Search,
    Explain,
    Review,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Implement => "implement",
            Intent::Debug => "debug",
            Intent::Refactor => "refactor",
            Intent::Search => "search",
            Intent::Explain => "explain",
            Intent::Review => "review",
        }
    }
}

impl std::str::FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implement" => Ok(Intent::Implement),
            "debug" => Ok(Intent::Debug),
            "refactor" => Ok(Intent::Refactor),
            "search" => Ok(Intent::Search),
            "explain" => Ok(Intent::Explain),
            "review" => Ok(Intent::Review),
            _ => Err(format!("unknown intent: {}", s)),
        }
    }
}

/// Role a tool call plays in the work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolContext {
    Exploration,
    Implementation,
    Verification,
}

impl ToolContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolContext::Exploration => "exploration",
            ToolContext::Implementation => "implementation",
            ToolContext::Verification => "verification",
        }
    }
}

/// Coarse tool family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    FileOps,
    Search,
    Bash,
    Web,
    Task,
    Question,
    Plan,
    Mcp,
    Other,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::FileOps => "file_ops",
            ToolCategory::Search => "search",
            ToolCategory::Bash => "bash",
            ToolCategory::Web => "web",
            ToolCategory::Task => "task",
            ToolCategory::Question => "question",
            ToolCategory::Plan => "plan",
            ToolCategory::Mcp => "mcp",
            ToolCategory::Other => "other",
        }
    }
}

/// Error family derived from error text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Permission,
    NotFound,
    Timeout,
    Syntax,
    Validation,
    Runtime,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Permission => "permission",
            ErrorType::NotFound => "not_found",
            ErrorType::Timeout => "timeout",
            ErrorType::Syntax => "syntax",
            ErrorType::Validation => "validation",
            ErrorType::Runtime => "runtime",
        }
    }
}

/// How a tool touched a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    Modify,
    Search,
    Execute,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
            AccessMode::Modify => "modify",
            AccessMode::Search => "search",
            AccessMode::Execute => "execute",
        }
    }

    /// Whether the access changes file content
    pub fn is_write(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::Modify)
    }
}

impl std::str::FromStr for AccessMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(AccessMode::Read),
            "write" => Ok(AccessMode::Write),
            "modify" => Ok(AccessMode::Modify),
            "search" => Ok(AccessMode::Search),
            "execute" => Ok(AccessMode::Execute),
            _ => Err(format!("unknown access mode: {}", s)),
        }
    }
}

// ============================================
// Session
// ============================================

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

/// One host run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Working directory reported by the host
    pub project_path: Option<String>,
    pub status: SessionStatus,
    pub prompt_count: u64,
    pub tool_count: u64,
    /// How the host started the session (startup, resume, clear...)
    pub source: Option<String>,
    pub end_reason: Option<String>,
}

// ============================================
// Prompt
// ============================================

/// One user submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub session_id: String,
    /// 1-based, gap-free within the session
    pub seq: u64,
    /// Truncated prompt text
    pub text: String,
    /// sha256 of the full text, for dedup
    pub text_hash: String,
    pub word_count: usize,
    pub timestamp: DateTime<Utc>,
    pub intent: Intent,
    pub keywords: Vec<String>,
    pub task_id: Option<String>,
}

// ============================================
// Tool calls
// ============================================

/// A "before" half waiting for its "after" half.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCall {
    pub call_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    /// Sanitized input
    pub input: serde_json::Value,
    pub started_at: DateTime<Utc>,
}

/// How a ToolCall came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOrigin {
    /// Both halves observed
    Matched,
    /// "After" half arrived with no pending "before"
    OrphanedPost,
    /// "Before" half expired without an "after"
    OrphanedPre,
    /// Reconstructed from a subagent transcript
    Transcript,
}

impl CallOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOrigin::Matched => "matched",
            CallOrigin::OrphanedPost => "orphaned_post",
            CallOrigin::OrphanedPre => "orphaned_pre",
            CallOrigin::Transcript => "transcript",
        }
    }
}

/// A file path referenced by a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAccess {
    pub path: String,
    pub mode: AccessMode,
    /// The tool's own target, as opposed to a path found in its output
    pub is_primary: bool,
    /// Path came from glob/grep result expansion
    pub is_expansion: bool,
}

/// A merged pre/post record.
///
/// `duration_ms` and `success` are `None` when they could not be measured
/// (orphaned halves); `Some(0)` is a real, clamped measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub session_id: String,
    /// 1-based, gap-free within the owner (session or subagent)
    pub seq: u64,
    pub tool_name: String,
    pub tool_use_id: Option<String>,
    pub category: ToolCategory,
    pub context: ToolContext,
    /// Sanitized, length-capped input
    pub input: String,
    /// Length-capped output
    pub output: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    /// Normalized primary path
    pub file_path: Option<String>,
    #[serde(default)]
    pub files: Vec<FileAccess>,
    pub origin: CallOrigin,
    pub task_id: Option<String>,
    /// Set when the call was performed by a subagent
    pub subagent_id: Option<String>,
}

impl ToolCall {
    /// Best timestamp for ordering: end, else start.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.ended_at.or(self.started_at)
    }

    pub fn failed(&self) -> bool {
        self.success == Some(false)
    }
}

// ============================================
// Task
// ============================================

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
        }
    }
}

/// A derived grouping of prompts and tool calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Natural key, `task:<session>:<index>`
    pub id: String,
    pub session_id: String,
    /// 1-based ordinal within the session
    pub index: u64,
    pub task_type: Intent,
    pub keywords: Vec<String>,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub prompt_count: u64,
    pub tool_count: u64,
    pub failure_count: u64,
    pub last_call_success: Option<bool>,
    pub files: Vec<String>,
    pub success: Option<bool>,
    pub complexity: f64,
}

// ============================================
// Errors and solutions
// ============================================

/// One failed tool call, classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInstance {
    /// Natural key, `error:<session>:<tool seq>`
    pub key: String,
    pub session_id: String,
    pub tool_seq: u64,
    pub tool_name: String,
    pub error_type: ErrorType,
    pub signature: String,
    pub message: String,
    pub file_path: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub resolved: bool,
}

/// Marks an ErrorInstance resolved by a later successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResolution {
    pub error_key: String,
    pub session_id: String,
    /// Natural key of the resolving ToolCall
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
    pub solution_key: String,
    pub signature: String,
    /// Tool names from the failing call through the resolving call
    pub tool_sequence: Vec<String>,
}

/// A deduplicated fix pattern with running effectiveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub key: String,
    pub signature: String,
    pub tool_sequence: Vec<String>,
    pub successes: u64,
    pub failures: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Solution {
    /// successes / (successes + failures)
    pub fn effectiveness(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

// ============================================
// Subagents and metrics
// ============================================

/// A nested session run by a subagent of the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subagent {
    pub agent_id: String,
    pub parent_session_id: String,
    pub agent_type: Option<String>,
    pub transcript_path: Option<String>,
    pub stopped_at: DateTime<Utc>,
    pub tool_count: u64,
    pub failed_count: u64,
    /// Natural key of the parent ToolCall that spawned this subagent
    pub spawned_by: Option<String>,
}

/// Final aggregate stats for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub session_id: String,
    pub total_prompts: u64,
    pub total_tools: u64,
    pub tool_usage: BTreeMap<String, u64>,
    pub most_used_tool: Option<String>,
    /// Mean over calls with a measured duration
    pub avg_duration_ms: Option<f64>,
    pub measured_calls: u64,
    pub failed_calls: u64,
    pub task_count: u64,
    pub error_count: u64,
    pub resolved_error_count: u64,
    pub subagent_count: u64,
    pub duration_secs: Option<i64>,
}

// ============================================
// Durable log records
// ============================================

/// Record kind stored in the durable log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Session,
    Prompt,
    ToolCall,
    Task,
    ErrorInstance,
    ErrorResolved,
    Subagent,
    Metrics,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Session => "session",
            RecordKind::Prompt => "prompt",
            RecordKind::ToolCall => "tool_call",
            RecordKind::Task => "task",
            RecordKind::ErrorInstance => "error_instance",
            RecordKind::ErrorResolved => "error_resolved",
            RecordKind::Subagent => "subagent",
            RecordKind::Metrics => "metrics",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(RecordKind::Session),
            "prompt" => Ok(RecordKind::Prompt),
            "tool_call" => Ok(RecordKind::ToolCall),
            "task" => Ok(RecordKind::Task),
            "error_instance" => Ok(RecordKind::ErrorInstance),
            "error_resolved" => Ok(RecordKind::ErrorResolved),
            "subagent" => Ok(RecordKind::Subagent),
            "metrics" => Ok(RecordKind::Metrics),
            _ => Err(format!("unknown record kind: {}", s)),
        }
    }
}

/// Typed body of a log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordPayload {
    Session(Session),
    Prompt(Prompt),
    ToolCall(ToolCall),
    Task(Task),
    ErrorInstance(ErrorInstance),
    ErrorResolved(ErrorResolution),
    Subagent(Subagent),
    Metrics(Metrics),
}

impl RecordPayload {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordPayload::Session(_) => RecordKind::Session,
            RecordPayload::Prompt(_) => RecordKind::Prompt,
            RecordPayload::ToolCall(_) => RecordKind::ToolCall,
            RecordPayload::Task(_) => RecordKind::Task,
            RecordPayload::ErrorInstance(_) => RecordKind::ErrorInstance,
            RecordPayload::ErrorResolved(_) => RecordKind::ErrorResolved,
            RecordPayload::Subagent(_) => RecordKind::Subagent,
            RecordPayload::Metrics(_) => RecordKind::Metrics,
        }
    }

    /// Deterministic key the graph node is merged on.
    pub fn natural_key(&self) -> String {
        match self {
            RecordPayload::Session(s) => keys::session(&s.id),
            RecordPayload::Prompt(p) => keys::prompt(&p.session_id, p.seq),
            RecordPayload::ToolCall(t) => keys::tool_call(t),
            RecordPayload::Task(t) => t.id.clone(),
            RecordPayload::ErrorInstance(e) => e.key.clone(),
            RecordPayload::ErrorResolved(r) => r.error_key.clone(),
            RecordPayload::Subagent(a) => keys::subagent(&a.agent_id),
            RecordPayload::Metrics(m) => keys::metrics(&m.session_id),
        }
    }
}

/// Natural key builders
pub mod keys {
    use super::ToolCall;

    pub fn session(session_id: &str) -> String {
        format!("session:{}", session_id)
    }

    pub fn prompt(session_id: &str, seq: u64) -> String {
        format!("prompt:{}:{}", session_id, seq)
    }

    pub fn tool(session_id: &str, seq: u64) -> String {
        format!("tool:{}:{}", session_id, seq)
    }

    pub fn subagent_tool(session_id: &str, agent_id: &str, seq: u64) -> String {
        format!("subtool:{}:{}:{}", session_id, agent_id, seq)
    }

    pub fn tool_call(call: &ToolCall) -> String {
        match &call.subagent_id {
            Some(agent) => subagent_tool(&call.session_id, agent, call.seq),
            None => tool(&call.session_id, call.seq),
        }
    }

    pub fn task(session_id: &str, index: u64) -> String {
        format!("task:{}:{}", session_id, index)
    }

    pub fn error(session_id: &str, tool_seq: u64) -> String {
        format!("error:{}:{}", session_id, tool_seq)
    }

    pub fn subagent(agent_id: &str) -> String {
        format!("subagent:{}", agent_id)
    }

    pub fn metrics(session_id: &str) -> String {
        format!("metrics:{}", session_id)
    }

    pub fn file(path: &str) -> String {
        format!("file:{}", path)
    }
}

/// One row of the durable log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub session_id: String,
    /// 1-based, gap-free within the session
    pub seq: u64,
    pub natural_key: String,
    pub payload: RecordPayload,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
}

impl LogRecord {
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }
}

/// Per-session projection progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncCursor {
    /// Highest record seq whose nodes are in the graph
    pub node_seq: u64,
    /// Highest record seq whose derived edges are in the graph
    pub edge_seq: u64,
}
