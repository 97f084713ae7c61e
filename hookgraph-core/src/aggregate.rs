//! Session and task aggregation
//!
//! [`SessionState`] is the whole per-session memory: counters, the open
//! task, unresolved errors. It is loaded and saved around every event by
//! the recorder, so the transitions here are plain functions over it that
//! return the records to append.

use crate::classify::{
    classify_error_type, classify_intent, classify_tool_category, classify_tool_context,
    content_hash, extract_file_accesses, extract_keywords, jaccard, normalize_error_signature,
    response_text, truncate, word_count,
};
use crate::config::Config;
use crate::correlate::CompletedCall;
use crate::event::{PromptSubmit, SessionEnd, SessionStart, SubagentStop};
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Keywords kept on a task after merging its prompts
const MAX_TASK_KEYWORDS: usize = 50;

/// Distinct files tracked per task
const MAX_TASK_FILES: usize = 200;

/// Tool names remembered between an error and its resolution
const MAX_TRAIL: usize = 20;

/// Tunables for aggregation
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Prompt gap that starts a new task
    pub task_gap: Duration,
    /// Keyword overlap below which a new task starts
    pub keyword_overlap: f64,
    pub max_keywords: usize,
    pub prompt_limit: usize,
    pub input_limit: usize,
    pub output_limit: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for AggregatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            task_gap: Duration::minutes(config.tasks.gap_minutes as i64),
            keyword_overlap: config.tasks.keyword_overlap,
            max_keywords: config.tasks.max_keywords,
            prompt_limit: config.correlator.prompt_limit,
            input_limit: config.correlator.input_limit,
            output_limit: config.correlator.output_limit,
        }
    }
}

/// An error still waiting for a fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenError {
    pub key: String,
    pub signature: String,
    pub tool_name: String,
    pub file_path: Option<String>,
    /// Tool names from the failing call onward
    pub trail: Vec<String>,
}

/// Everything the aggregator remembers about one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session: Session,
    pub next_prompt_seq: u64,
    pub next_tool_seq: u64,
    pub open_task: Option<Task>,
    pub task_count: u64,
    pub last_prompt_at: Option<DateTime<Utc>>,
    pub tool_usage: BTreeMap<String, u64>,
    pub measured_duration_ms: i64,
    pub measured_calls: u64,
    pub failed_calls: u64,
    pub error_count: u64,
    pub resolved_error_count: u64,
    pub open_errors: Vec<OpenError>,
    /// signature -> solution key, for recurrence tracking
    pub resolved_signatures: BTreeMap<String, String>,
    /// agent id -> tool calls recorded
    pub subagents: BTreeMap<String, u64>,
    /// Latest task-category call not yet linked to a subagent
    pub last_spawn_call: Option<String>,
}

impl SessionState {
    /// Fresh state for a session first seen at `at`.
    pub fn new(session_id: &str, at: DateTime<Utc>, project_path: Option<&str>) -> Self {
        Self {
            session: Session {
                id: session_id.to_string(),
                started_at: at,
                ended_at: None,
                project_path: project_path.map(str::to_string),
                status: SessionStatus::Active,
                prompt_count: 0,
                tool_count: 0,
                source: None,
                end_reason: None,
            },
            next_prompt_seq: 1,
            next_tool_seq: 1,
            open_task: None,
            task_count: 0,
            last_prompt_at: None,
            tool_usage: BTreeMap::new(),
            measured_duration_ms: 0,
            measured_calls: 0,
            failed_calls: 0,
            error_count: 0,
            resolved_error_count: 0,
            open_errors: Vec::new(),
            resolved_signatures: BTreeMap::new(),
            subagents: BTreeMap::new(),
            last_spawn_call: None,
        }
    }
}

/// Whether a solution worked or a resolved problem came back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolutionOutcome {
    Success,
    Failure,
}

/// Counter change for the local solutions table
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionUpdate {
    pub key: String,
    pub signature: String,
    pub tool_sequence: Vec<String>,
    pub outcome: SolutionOutcome,
    pub at: DateTime<Utc>,
}

/// Output of one transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Emitted {
    /// Records to append, in order
    pub records: Vec<RecordPayload>,
    pub solutions: Vec<SolutionUpdate>,
}

impl Emitted {
    fn push(&mut self, record: RecordPayload) {
        self.records.push(record);
    }
}

/// Key of the solution formed by `signature` and the tools that fixed it.
pub fn solution_key(signature: &str, tool_sequence: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signature.as_bytes());
    hasher.update(b"\n");
    hasher.update(tool_sequence.join(">").as_bytes());
    format!("solution:{}", hex::encode(&hasher.finalize()[..8]))
}

/// Task-boundary predicate: a logical OR of its triggers.
///
/// Fires with no open task, after a long gap since the last prompt, on an
/// intent change, or when keyword overlap with the task drops below the
/// threshold. Overlap is skipped when either keyword set is empty.
pub fn is_task_boundary(
    task: Option<&Task>,
    last_prompt_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    intent: Intent,
    keywords: &[String],
    config: &AggregatorConfig,
) -> bool {
    let Some(task) = task else {
        return true;
    };
    if last_prompt_at.is_some_and(|last| now - last > config.task_gap) {
        return true;
    }
    if task.task_type != intent {
        return true;
    }
    !keywords.is_empty()
        && !task.keywords.is_empty()
        && jaccard(keywords, &task.keywords) < config.keyword_overlap
}

/// ln(1 + tools) + 0.25 × files + 0.5 × failures, two decimals
pub fn task_complexity(task: &Task) -> f64 {
    let raw = ((1 + task.tool_count) as f64).ln()
        + 0.25 * task.files.len() as f64
        + 0.5 * task.failure_count as f64;
    (raw * 100.0).round() / 100.0
}

/// Pure session/task transitions
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Current session row, for lazily created sessions.
    pub fn session_snapshot(&self, state: &SessionState) -> RecordPayload {
        RecordPayload::Session(state.session.clone())
    }

    pub fn on_session_start(&self, state: &mut SessionState, event: &SessionStart) -> Emitted {
        let session = &mut state.session;
        if event.timestamp < session.started_at {
            session.started_at = event.timestamp;
        }
        if event.cwd.is_some() {
            session.project_path = event.cwd.clone();
        }
        session.source = event.source.clone();
        // A resumed session becomes active again
        session.status = SessionStatus::Active;
        session.ended_at = None;

        let mut out = Emitted::default();
        out.push(RecordPayload::Session(session.clone()));
        out
    }

    pub fn on_prompt(&self, state: &mut SessionState, event: &PromptSubmit) -> Emitted {
        let mut out = Emitted::default();
        let now = event.timestamp;

        let seq = state.next_prompt_seq;
        state.next_prompt_seq += 1;
        state.session.prompt_count += 1;

        let intent = classify_intent(&event.prompt);
        let keywords = extract_keywords(&event.prompt, self.config.max_keywords);

        if is_task_boundary(
            state.open_task.as_ref(),
            state.last_prompt_at,
            now,
            intent,
            &keywords,
            &self.config,
        ) {
            if let Some(closed) = self.close_task(state, now) {
                out.push(RecordPayload::Task(closed));
            }
            let task = self.open_task(state, now, intent, keywords.clone());
            out.push(RecordPayload::Task(task));
        }

        let task_id = state.open_task.as_mut().map(|task| {
            task.prompt_count += 1;
            for kw in &keywords {
                if task.keywords.len() >= MAX_TASK_KEYWORDS {
                    break;
                }
                if !task.keywords.contains(kw) {
                    task.keywords.push(kw.clone());
                }
            }
            task.id.clone()
        });
        state.last_prompt_at = Some(now);

        out.push(RecordPayload::Prompt(Prompt {
            session_id: state.session.id.clone(),
            seq,
            text: truncate(&event.prompt, self.config.prompt_limit),
            text_hash: content_hash(&event.prompt),
            word_count: word_count(&event.prompt),
            timestamp: now,
            intent,
            keywords,
            task_id,
        }));
        out
    }

    /// Sequence a parent-level tool call and update errors and stats.
    pub fn on_tool_call(&self, state: &mut SessionState, call: CompletedCall) -> Emitted {
        let mut out = Emitted::default();
        let at = call.ended_at.or(call.started_at).unwrap_or(state.session.started_at);

        let seq = state.next_tool_seq;
        state.next_tool_seq += 1;
        state.session.tool_count += 1;
        *state.tool_usage.entry(call.tool_name.clone()).or_insert(0) += 1;
        if let Some(ms) = call.duration_ms {
            state.measured_duration_ms += ms;
            state.measured_calls += 1;
        }

        let task_id = self.ensure_task(state, at, &mut out);
        let tool = self.build_tool_call(&call, seq, Some(task_id), None);
        let key = keys::tool_call(&tool);

        if tool.failed() {
            state.failed_calls += 1;
        }
        if let Some(task) = state.open_task.as_mut() {
            task.tool_count += 1;
            if tool.failed() {
                task.failure_count += 1;
            }
            if tool.success.is_some() {
                task.last_call_success = tool.success;
            }
            for file in &tool.files {
                if task.files.len() < MAX_TASK_FILES && !task.files.contains(&file.path) {
                    task.files.push(file.path.clone());
                }
            }
        }
        if tool.category == ToolCategory::Task {
            state.last_spawn_call = Some(key.clone());
        }

        for open in state.open_errors.iter_mut() {
            if open.trail.len() < MAX_TRAIL {
                open.trail.push(tool.tool_name.clone());
            }
        }

        let follow_up = match tool.success {
            Some(false) => self.record_error(state, &tool, seq, at),
            Some(true) => self.resolve_errors(state, &tool, &key, at),
            None => Emitted::default(),
        };

        out.push(RecordPayload::ToolCall(tool));
        out.records.extend(follow_up.records);
        out.solutions.extend(follow_up.solutions);
        out
    }

    fn record_error(
        &self,
        state: &mut SessionState,
        tool: &ToolCall,
        seq: u64,
        at: DateTime<Utc>,
    ) -> Emitted {
        let mut out = Emitted::default();
        let message = tool.error.clone().unwrap_or_else(|| "unknown error".to_string());
        let signature = normalize_error_signature(&message, &tool.tool_name);

        if let Some(solution) = state.resolved_signatures.get(&signature) {
            tracing::debug!(
                session_id = %state.session.id,
                solution = %solution,
                "Resolved problem recurred"
            );
            out.solutions.push(SolutionUpdate {
                key: solution.clone(),
                signature: signature.clone(),
                tool_sequence: Vec::new(),
                outcome: SolutionOutcome::Failure,
                at,
            });
        }

        let key = keys::error(&state.session.id, seq);
        state.error_count += 1;
        state.open_errors.push(OpenError {
            key: key.clone(),
            signature: signature.clone(),
            tool_name: tool.tool_name.clone(),
            file_path: tool.file_path.clone(),
            trail: vec![tool.tool_name.clone()],
        });

        out.push(RecordPayload::ErrorInstance(ErrorInstance {
            key,
            session_id: state.session.id.clone(),
            tool_seq: seq,
            tool_name: tool.tool_name.clone(),
            error_type: tool.error_type.unwrap_or(ErrorType::Runtime),
            signature,
            message: truncate(&message, 500),
            file_path: tool.file_path.clone(),
            occurred_at: at,
            resolved: false,
        }));
        out
    }

    /// Resolve open errors fixed by this successful call.
    ///
    /// An error with a file is fixed by success on the same file; one
    /// without a file by success of the same tool.
    fn resolve_errors(
        &self,
        state: &mut SessionState,
        tool: &ToolCall,
        tool_key: &str,
        at: DateTime<Utc>,
    ) -> Emitted {
        let mut out = Emitted::default();
        let (fixed, still_open): (Vec<OpenError>, Vec<OpenError>) =
            std::mem::take(&mut state.open_errors)
                .into_iter()
                .partition(|open| match &open.file_path {
                    Some(path) => tool.files.iter().any(|f| &f.path == path),
                    None => open.tool_name == tool.tool_name,
                });
        state.open_errors = still_open;

        for open in fixed {
            let solution = solution_key(&open.signature, &open.trail);
            state.resolved_error_count += 1;
            state
                .resolved_signatures
                .insert(open.signature.clone(), solution.clone());

            out.solutions.push(SolutionUpdate {
                key: solution.clone(),
                signature: open.signature.clone(),
                tool_sequence: open.trail.clone(),
                outcome: SolutionOutcome::Success,
                at,
            });
            out.push(RecordPayload::ErrorResolved(ErrorResolution {
                error_key: open.key,
                session_id: state.session.id.clone(),
                resolved_by: tool_key.to_string(),
                resolved_at: at,
                solution_key: solution,
                signature: open.signature,
                tool_sequence: open.trail,
            }));
        }
        out
    }

    /// Record a subagent and the calls it made.
    ///
    /// The calls are numbered within the subagent and leave the parent's
    /// counters alone. A repeated stop for the same agent is ignored.
    /// Failed subagent calls open no ErrorInstance; error tracking covers
    /// the parent session only.
    pub fn on_subagent(
        &self,
        state: &mut SessionState,
        event: &SubagentStop,
        calls: Vec<CompletedCall>,
    ) -> Emitted {
        let mut out = Emitted::default();
        if state.subagents.contains_key(&event.agent_id) {
            tracing::debug!(agent_id = %event.agent_id, "Duplicate subagent stop ignored");
            return out;
        }

        let task_id = self.ensure_task(state, event.timestamp, &mut out);
        let tools: Vec<ToolCall> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                self.build_tool_call(
                    call,
                    i as u64 + 1,
                    Some(task_id.clone()),
                    Some(event.agent_id.clone()),
                )
            })
            .collect();

        state.subagents.insert(event.agent_id.clone(), tools.len() as u64);
        out.push(RecordPayload::Subagent(Subagent {
            agent_id: event.agent_id.clone(),
            parent_session_id: state.session.id.clone(),
            agent_type: event.agent_type.clone(),
            transcript_path: event
                .transcript_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            stopped_at: event.timestamp,
            tool_count: tools.len() as u64,
            failed_count: tools.iter().filter(|t| t.failed()).count() as u64,
            spawned_by: state.last_spawn_call.take(),
        }));
        out.records
            .extend(tools.into_iter().map(RecordPayload::ToolCall));
        out
    }

    /// Close the open task and the session, and summarize it.
    pub fn on_session_end(&self, state: &mut SessionState, event: &SessionEnd) -> Emitted {
        let mut out = Emitted::default();
        let now = event.timestamp;

        if let Some(closed) = self.close_task(state, now) {
            out.push(RecordPayload::Task(closed));
        }

        state.session.ended_at = Some(now);
        state.session.status = SessionStatus::Completed;
        state.session.end_reason = event.reason.clone();
        out.push(RecordPayload::Session(state.session.clone()));
        out.push(RecordPayload::Metrics(self.metrics(state)));
        out
    }

    /// Final aggregate stats for the session.
    pub fn metrics(&self, state: &SessionState) -> Metrics {
        let mut most_used: Option<(&String, u64)> = None;
        for (tool, count) in &state.tool_usage {
            if most_used.map_or(true, |(_, best)| *count > best) {
                most_used = Some((tool, *count));
            }
        }

        Metrics {
            session_id: state.session.id.clone(),
            total_prompts: state.session.prompt_count,
            total_tools: state.session.tool_count,
            tool_usage: state.tool_usage.clone(),
            most_used_tool: most_used.map(|(tool, _)| tool.clone()),
            avg_duration_ms: (state.measured_calls > 0)
                .then(|| state.measured_duration_ms as f64 / state.measured_calls as f64),
            measured_calls: state.measured_calls,
            failed_calls: state.failed_calls,
            task_count: state.task_count,
            error_count: state.error_count,
            resolved_error_count: state.resolved_error_count,
            subagent_count: state.subagents.len() as u64,
            duration_secs: state
                .session
                .ended_at
                .map(|end| (end - state.session.started_at).num_seconds().max(0)),
        }
    }

    fn open_task(
        &self,
        state: &mut SessionState,
        at: DateTime<Utc>,
        intent: Intent,
        keywords: Vec<String>,
    ) -> Task {
        state.task_count += 1;
        let task = Task {
            id: keys::task(&state.session.id, state.task_count),
            session_id: state.session.id.clone(),
            index: state.task_count,
            task_type: intent,
            keywords,
            status: TaskStatus::Active,
            started_at: at,
            ended_at: None,
            prompt_count: 0,
            tool_count: 0,
            failure_count: 0,
            last_call_success: None,
            files: Vec::new(),
            success: None,
            complexity: 0.0,
        };
        state.open_task = Some(task.clone());
        task
    }

    fn close_task(&self, state: &mut SessionState, at: DateTime<Utc>) -> Option<Task> {
        let mut task = state.open_task.take()?;
        task.status = TaskStatus::Completed;
        task.ended_at = Some(at.max(task.started_at));
        task.success = Some(task.failure_count == 0 || task.last_call_success == Some(true));
        task.complexity = task_complexity(&task);
        Some(task)
    }

    /// Open task id, opening a default task when none is open.
    fn ensure_task(&self, state: &mut SessionState, at: DateTime<Utc>, out: &mut Emitted) -> String {
        if let Some(task) = &state.open_task {
            return task.id.clone();
        }
        let task = self.open_task(state, at, Intent::Implement, Vec::new());
        let id = task.id.clone();
        out.push(RecordPayload::Task(task));
        id
    }

    fn build_tool_call(
        &self,
        call: &CompletedCall,
        seq: u64,
        task_id: Option<String>,
        subagent_id: Option<String>,
    ) -> ToolCall {
        let files = extract_file_accesses(&call.tool_name, &call.input, Some(&call.response));
        let failed = call.success == Some(false);

        ToolCall {
            call_id: call.call_id.clone(),
            session_id: call.session_id.clone(),
            seq,
            tool_name: call.tool_name.clone(),
            tool_use_id: call.tool_use_id.clone(),
            category: classify_tool_category(&call.tool_name),
            context: classify_tool_context(&call.tool_name, &call.input),
            input: truncate(&call.input.to_string(), self.config.input_limit),
            output: response_text(&call.response)
                .map(|text| truncate(&text, self.config.output_limit)),
            started_at: call.started_at,
            ended_at: call.ended_at,
            duration_ms: call.duration_ms,
            success: call.success,
            error: if failed { call.error.clone() } else { None },
            error_type: failed
                .then(|| classify_error_type(call.error.as_deref().unwrap_or(""))),
            file_path: files.iter().find(|f| f.is_primary).map(|f| f.path.clone()),
            files,
            origin: call.origin,
            task_id,
            subagent_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn prompt(text: &str, secs: i64) -> PromptSubmit {
        PromptSubmit {
            session_id: "s1".to_string(),
            timestamp: at(secs),
            prompt: text.to_string(),
            cwd: None,
        }
    }

    fn call(tool: &str, input: Value, success: Option<bool>, error: Option<&str>, secs: i64) -> CompletedCall {
        CompletedCall {
            call_id: format!("s1:{}:{}", tool, secs),
            session_id: "s1".to_string(),
            tool_name: tool.to_string(),
            tool_use_id: None,
            input,
            response: Value::Null,
            started_at: Some(at(secs)),
            ended_at: Some(at(secs + 1)),
            duration_ms: Some(1000),
            success,
            error: error.map(str::to_string),
            origin: CallOrigin::Matched,
        }
    }

    fn tasks_of(emitted: &Emitted) -> Vec<&Task> {
        emitted
            .records
            .iter()
            .filter_map(|r| match r {
                RecordPayload::Task(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    fn prompt_task(emitted: &Emitted) -> Option<String> {
        emitted.records.iter().find_map(|r| match r {
            RecordPayload::Prompt(p) => p.task_id.clone(),
            _ => None,
        })
    }

    #[test]
    fn test_first_prompt_opens_task() {
        let agg = Aggregator::default();
        let mut state = SessionState::new("s1", at(0), None);
        let out = agg.on_prompt(&mut state, &prompt("fix the login bug", 0));

        let tasks = tasks_of(&out);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, Intent::Debug);
        assert_eq!(prompt_task(&out).as_deref(), Some("task:s1:1"));
        assert_eq!(state.session.prompt_count, 1);
    }

    #[test]
    fn test_same_task_when_close_and_similar() {
        let agg = Aggregator::default();
        let mut state = SessionState::new("s1", at(0), None);
        let first = agg.on_prompt(&mut state, &prompt("fix login bug form", 0));
        let second = agg.on_prompt(&mut state, &prompt("fix login bug again", 60));

        assert!(tasks_of(&second).is_empty());
        assert_eq!(prompt_task(&first), prompt_task(&second));
    }

    #[test]
    fn test_gap_starts_new_task() {
        let agg = Aggregator::default();
        let mut state = SessionState::new("s1", at(0), None);
        let first = agg.on_prompt(&mut state, &prompt("fix login bug", 0));
        let second = agg.on_prompt(&mut state, &prompt("fix login bug", 11 * 60));

        let tasks = tasks_of(&second);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[1].status, TaskStatus::Active);
        assert_ne!(prompt_task(&first), prompt_task(&second));
    }

    #[test]
    fn test_intent_shift_starts_new_task() {
        let agg = Aggregator::default();
        let mut state = SessionState::new("s1", at(0), None);
        let first = agg.on_prompt(&mut state, &prompt("fix login flow session", 0));
        // Keywords overlap well above the threshold, so only intent differs
        let second = agg.on_prompt(&mut state, &prompt("explain login flow session", 30));

        let tasks = tasks_of(&second);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].task_type, Intent::Debug);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[1].task_type, Intent::Explain);
        assert_eq!(state.task_count, 2);
        assert_ne!(prompt_task(&first), prompt_task(&second));
    }

    #[test]
    fn test_keyword_drop_starts_new_task() {
        let agg = Aggregator::default();
        let mut state = SessionState::new("s1", at(0), None);
        agg.on_prompt(&mut state, &prompt("add signup form validation", 0));
        let second = agg.on_prompt(&mut state, &prompt("add database migration script", 30));
        assert_eq!(tasks_of(&second).len(), 2);
    }

    #[test]
    fn test_tool_call_never_taskless() {
        let agg = Aggregator::default();
        let mut state = SessionState::new("s1", at(0), None);
        let out = agg.on_tool_call(&mut state, call("Read", json!({"file_path": "/a"}), Some(true), None, 0));

        assert_eq!(tasks_of(&out).len(), 1);
        let tool = out
            .records
            .iter()
            .find_map(|r| match r {
                RecordPayload::ToolCall(t) => Some(t),
                _ => None,
            })
            .unwrap();
        assert_eq!(tool.task_id.as_deref(), Some("task:s1:1"));
        assert_eq!(tool.seq, 1);
        assert_eq!(tool.file_path.as_deref(), Some("/a"));
    }

    #[test]
    fn test_error_resolution_and_recurrence() {
        let agg = Aggregator::default();
        let mut state = SessionState::new("s1", at(0), None);

        let failed = agg.on_tool_call(
            &mut state,
            call("Read", json!({"file_path": "/a/auth.py"}), Some(false), Some("not found"), 0),
        );
        assert!(failed
            .records
            .iter()
            .any(|r| matches!(r, RecordPayload::ErrorInstance(e) if e.error_type == ErrorType::NotFound)));
        assert_eq!(state.open_errors.len(), 1);

        let fixed = agg.on_tool_call(
            &mut state,
            call("Write", json!({"file_path": "/a/auth.py", "content": "x"}), Some(true), None, 5),
        );
        let resolution = fixed
            .records
            .iter()
            .find_map(|r| match r {
                RecordPayload::ErrorResolved(res) => Some(res),
                _ => None,
            })
            .unwrap();
        assert_eq!(resolution.error_key, "error:s1:1");
        assert_eq!(resolution.resolved_by, "tool:s1:2");
        assert_eq!(resolution.tool_sequence, vec!["Read", "Write"]);
        assert_eq!(fixed.solutions.len(), 1);
        assert_eq!(fixed.solutions[0].outcome, SolutionOutcome::Success);
        assert!(state.open_errors.is_empty());

        // A second success on the same file resolves nothing more
        let again = agg.on_tool_call(
            &mut state,
            call("Write", json!({"file_path": "/a/auth.py"}), Some(true), None, 9),
        );
        assert!(again.solutions.is_empty());

        // Same problem on another file counts against the solution
        let recurred = agg.on_tool_call(
            &mut state,
            call("Read", json!({"file_path": "/b/auth.py"}), Some(false), Some("not found"), 12),
        );
        assert_eq!(recurred.solutions.len(), 1);
        assert_eq!(recurred.solutions[0].outcome, SolutionOutcome::Failure);
        assert_eq!(recurred.solutions[0].key, resolution.solution_key);
    }

    #[test]
    fn test_subagent_calls_not_counted_at_parent() {
        let agg = Aggregator::default();
        let mut state = SessionState::new("s1", at(0), None);
        agg.on_tool_call(&mut state, call("Task", json!({"subagent_type": "explore"}), Some(true), None, 0));

        let stop = SubagentStop {
            session_id: "s1".to_string(),
            timestamp: at(30),
            agent_id: "a1".to_string(),
            agent_type: Some("explore".to_string()),
            transcript_path: None,
        };
        let calls = vec![
            call("Grep", json!({"pattern": "x"}), Some(true), None, 10),
            call("Read", json!({"file_path": "/x"}), Some(false), Some("denied"), 11),
        ];
        let out = agg.on_subagent(&mut state, &stop, calls.clone());

        assert_eq!(state.session.tool_count, 1);
        let sub = out
            .records
            .iter()
            .find_map(|r| match r {
                RecordPayload::Subagent(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(sub.tool_count, 2);
        assert_eq!(sub.failed_count, 1);
        assert_eq!(sub.spawned_by.as_deref(), Some("tool:s1:1"));
        assert!(!out
            .records
            .iter()
            .any(|r| matches!(r, RecordPayload::ErrorInstance(_))));

        let keys: Vec<String> = out.records.iter().map(|r| r.natural_key()).collect();
        assert!(keys.contains(&"subtool:s1:a1:1".to_string()));
        assert!(keys.contains(&"subtool:s1:a1:2".to_string()));

        // Redelivery is a no-op
        assert!(agg.on_subagent(&mut state, &stop, calls).records.is_empty());
    }

    #[test]
    fn test_session_end_metrics() {
        let agg = Aggregator::default();
        let mut state = SessionState::new("s1", at(0), None);
        agg.on_prompt(&mut state, &prompt("add a parser", 0));
        agg.on_tool_call(&mut state, call("Read", json!({}), Some(true), None, 1));
        agg.on_tool_call(&mut state, call("Edit", json!({}), Some(true), None, 2));
        agg.on_tool_call(&mut state, call("Read", json!({}), Some(true), None, 3));
        let mut orphan = call("Bash", json!({}), None, None, 4);
        orphan.duration_ms = None;
        orphan.origin = CallOrigin::OrphanedPre;
        agg.on_tool_call(&mut state, orphan);

        let out = agg.on_session_end(
            &mut state,
            &SessionEnd {
                session_id: "s1".to_string(),
                timestamp: at(100),
                reason: Some("exit".to_string()),
            },
        );

        assert_eq!(state.session.status, SessionStatus::Completed);
        assert!(state.open_task.is_none());
        let metrics = out
            .records
            .iter()
            .find_map(|r| match r {
                RecordPayload::Metrics(m) => Some(m),
                _ => None,
            })
            .unwrap();
        assert_eq!(metrics.total_tools, 4);
        assert_eq!(metrics.most_used_tool.as_deref(), Some("Read"));
        assert_eq!(metrics.measured_calls, 3);
        assert_eq!(metrics.avg_duration_ms, Some(1000.0));
        assert_eq!(metrics.duration_secs, Some(100));

        let closed = tasks_of(&out);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].success, Some(true));
        assert_eq!(closed[0].tool_count, 4);
    }

    #[test]
    fn test_task_complexity() {
        let mut state = SessionState::new("s1", at(0), None);
        let agg = Aggregator::default();
        let task = agg.open_task(&mut state, at(0), Intent::Debug, vec![]);
        assert_eq!(task_complexity(&task), 0.0);

        let busy = Task {
            tool_count: 3,
            failure_count: 2,
            files: vec!["/a".to_string(), "/b".to_string()],
            ..task
        };
        // ln(4) + 0.5 + 1.0
        assert!((task_complexity(&busy) - 2.89).abs() < 1e-9);
    }

    #[test]
    fn test_solution_key_depends_on_sequence() {
        let a = solution_key("Read: not found", &["Read".to_string(), "Write".to_string()]);
        let b = solution_key("Read: not found", &["Read".to_string(), "Edit".to_string()]);
        assert_ne!(a, b);
        assert!(a.starts_with("solution:"));
    }
}
