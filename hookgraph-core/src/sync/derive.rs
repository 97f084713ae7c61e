//! Derived relationships
//!
//! Edges are computed per record against the whole session log, so the
//! result depends only on the log and never on how many sync passes it
//! took to get there.

use crate::graph::{EdgeKind, EdgeUpsert, NodeKind, NodeUpsert, Props};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Extra nodes and the edges one record contributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Derived {
    pub nodes: Vec<NodeUpsert>,
    pub edges: Vec<EdgeUpsert>,
}

/// Link from a prompt to the first parent tool call that started after it
#[derive(Debug, Clone)]
struct Trigger {
    prompt: String,
    gap_ms: i64,
    confidence: &'static str,
}

/// How a tool call relates to the previous call in the same chain
#[derive(Debug, Clone, Copy)]
struct Step {
    gap_ms: Option<i64>,
    same_file: bool,
}

/// Lookups over a full session log
pub struct DeriveContext {
    /// Tool record seq -> prompts whose first strictly later call it is
    triggers: HashMap<u64, Vec<Trigger>>,
    /// Tool record seq -> relation to the preceding call of its chain
    steps: HashMap<u64, Step>,
    /// Prompt seq -> milliseconds since the previous prompt
    prompt_gaps: HashMap<u64, i64>,
    /// File path -> log seqs of the tool calls that touched it, ascending
    file_touches: HashMap<String, Vec<u64>>,
}

impl DeriveContext {
    pub fn new(records: &[LogRecord]) -> Self {
        let mut triggers: HashMap<u64, Vec<Trigger>> = HashMap::new();
        let mut steps = HashMap::new();
        let mut prompt_gaps = HashMap::new();
        let mut file_touches: HashMap<String, Vec<u64>> = HashMap::new();

        let mut last_prompt: Option<DateTime<Utc>> = None;
        // Prompts still waiting for a call with a later timestamp
        let mut waiting: Vec<&Prompt> = Vec::new();
        // Parent chain is keyed by None, subagent chains by agent id
        let mut last_call: HashMap<Option<&str>, &ToolCall> = HashMap::new();

        for record in records {
            match &record.payload {
                RecordPayload::Prompt(p) => {
                    if let Some(previous) = last_prompt {
                        prompt_gaps.insert(p.seq, gap_ms(previous, p.timestamp));
                    }
                    last_prompt = Some(p.timestamp);
                    waiting.push(p);
                }
                RecordPayload::ToolCall(call) => {
                    let at = call_time(call);
                    let chain = call.subagent_id.as_deref();
                    if let Some(previous) = last_call.insert(chain, call) {
                        steps.insert(
                            record.seq,
                            Step {
                                gap_ms: call_time(previous).zip(at).map(|(a, b)| gap_ms(a, b)),
                                same_file: shares_file(previous, call),
                            },
                        );
                    }

                    if let (None, Some(at)) = (chain, at) {
                        waiting.retain(|p| {
                            if at <= p.timestamp {
                                return true;
                            }
                            triggers.entry(record.seq).or_default().push(Trigger {
                                prompt: keys::prompt(&p.session_id, p.seq),
                                gap_ms: gap_ms(p.timestamp, at),
                                confidence: trigger_confidence(p, call),
                            });
                            false
                        });
                    }

                    for file in &call.files {
                        file_touches
                            .entry(file.path.clone())
                            .or_default()
                            .push(record.seq);
                    }
                }
                _ => {}
            }
        }

        Self {
            triggers,
            steps,
            prompt_gaps,
            file_touches,
        }
    }

    /// Tool calls that touched `path` up to and including log seq `seq`.
    fn touches_through(&self, path: &str, seq: u64) -> usize {
        self.file_touches
            .get(path)
            .map_or(0, |seqs| seqs.partition_point(|s| *s <= seq))
    }
}

fn call_time(call: &ToolCall) -> Option<DateTime<Utc>> {
    call.started_at.or(call.ended_at)
}

fn gap_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds()
}

fn shares_file(a: &ToolCall, b: &ToolCall) -> bool {
    a.files
        .iter()
        .any(|fa| b.files.iter().any(|fb| fa.path == fb.path))
}

/// Ordering is all we know; a shared task makes the link more plausible.
fn trigger_confidence(prompt: &Prompt, call: &ToolCall) -> &'static str {
    match (&prompt.task_id, &call.task_id) {
        (Some(p), Some(c)) if p == c => "high",
        _ => "low",
    }
}

/// Nodes and edges contributed by one record.
///
/// `solution` is the current local row for a resolution's solution key.
pub fn derive_record(record: &LogRecord, ctx: &DeriveContext, solution: Option<&Solution>) -> Derived {
    let mut out = Derived::default();
    let session = keys::session(&record.session_id);

    match &record.payload {
        RecordPayload::Session(_) => {}
        RecordPayload::Prompt(p) => {
            let key = keys::prompt(&p.session_id, p.seq);
            out.edges
                .push(EdgeUpsert::new(EdgeKind::PartOfSession, &key, &session));
            if p.seq > 1 {
                let mut edge = EdgeUpsert::new(
                    EdgeKind::NextPrompt,
                    keys::prompt(&p.session_id, p.seq - 1),
                    &key,
                );
                if let Some(gap) = ctx.prompt_gaps.get(&p.seq) {
                    edge = edge.with_prop("gap_ms", *gap);
                }
                out.edges.push(edge);
            }
            if let Some(task) = &p.task_id {
                out.edges
                    .push(EdgeUpsert::new(EdgeKind::BelongsToTask, &key, task));
            }
        }
        RecordPayload::ToolCall(call) => tool_call_edges(record, call, ctx, &session, &mut out),
        RecordPayload::Task(task) => {
            out.edges
                .push(EdgeUpsert::new(EdgeKind::PartOfSession, &task.id, &session));
        }
        RecordPayload::ErrorInstance(e) => {
            out.edges.push(EdgeUpsert::new(
                EdgeKind::ProducedError,
                keys::tool(&e.session_id, e.tool_seq),
                &e.key,
            ));
            out.edges
                .push(EdgeUpsert::new(EdgeKind::PartOfSession, &e.key, &session));
        }
        RecordPayload::ErrorResolved(r) => {
            out.edges.push(
                EdgeUpsert::new(EdgeKind::ResolvedBy, &r.error_key, &r.resolved_by)
                    .with_prop("resolved_at", r.resolved_at.to_rfc3339()),
            );
            out.edges
                .push(EdgeUpsert::new(EdgeKind::FixedBy, &r.error_key, &r.solution_key));
            out.nodes.push(solution_node(r, solution));
        }
        RecordPayload::Subagent(a) => {
            let key = keys::subagent(&a.agent_id);
            out.edges
                .push(EdgeUpsert::new(EdgeKind::ChildOfSession, &key, &session));
            if let Some(spawner) = &a.spawned_by {
                out.edges
                    .push(EdgeUpsert::new(EdgeKind::TriggeredSubagent, spawner, &key));
            }
        }
        RecordPayload::Metrics(m) => {
            out.edges.push(EdgeUpsert::new(
                EdgeKind::Summarizes,
                keys::metrics(&m.session_id),
                &session,
            ));
        }
    }
    out
}

fn tool_call_edges(
    record: &LogRecord,
    call: &ToolCall,
    ctx: &DeriveContext,
    session: &str,
    out: &mut Derived,
) {
    let key = keys::tool_call(call);

    match &call.subagent_id {
        Some(agent) => {
            out.edges.push(EdgeUpsert::new(
                EdgeKind::PartOfSubagent,
                &key,
                keys::subagent(agent),
            ));
            if call.seq > 1 {
                out.edges.push(followed_by(
                    keys::subagent_tool(&call.session_id, agent, call.seq - 1),
                    &key,
                    ctx.steps.get(&record.seq),
                ));
            }
        }
        None => {
            out.edges
                .push(EdgeUpsert::new(EdgeKind::PartOfSession, &key, session));
            if call.seq > 1 {
                out.edges.push(followed_by(
                    keys::tool(&call.session_id, call.seq - 1),
                    &key,
                    ctx.steps.get(&record.seq),
                ));
            }
            for trigger in ctx.triggers.get(&record.seq).into_iter().flatten() {
                out.edges.push(
                    EdgeUpsert::new(EdgeKind::Triggered, &trigger.prompt, &key)
                        .with_prop("gap_ms", trigger.gap_ms)
                        .with_prop("confidence", trigger.confidence),
                );
            }
        }
    }

    if let Some(task) = &call.task_id {
        out.edges
            .push(EdgeUpsert::new(EdgeKind::BelongsToTask, &key, task));
    }

    for file in &call.files {
        let file_key = keys::file(&file.path);
        let mut props = Props::new();
        props.insert("path".into(), Value::String(file.path.clone()));
        out.nodes.push(NodeUpsert {
            kind: NodeKind::File,
            key: file_key.clone(),
            props,
        });
        out.edges.push(
            EdgeUpsert::new(EdgeKind::AccessedFile, &key, &file_key)
                .with_prop("mode", file.mode.as_str())
                .with_prop("is_primary", file.is_primary)
                .with_prop("is_expansion", file.is_expansion),
        );
        out.edges.push(
            EdgeUpsert::new(EdgeKind::SessionAccessed, session, &file_key)
                .with_prop("count", ctx.touches_through(&file.path, record.seq) as u64),
        );
    }
}

fn followed_by(from: String, to: &str, step: Option<&Step>) -> EdgeUpsert {
    let mut edge = EdgeUpsert::new(EdgeKind::FollowedBy, from, to);
    if let Some(step) = step {
        if let Some(gap) = step.gap_ms {
            edge = edge.with_prop("gap_ms", gap);
        }
        edge = edge.with_prop("same_file", step.same_file);
    }
    edge
}

fn solution_node(resolution: &ErrorResolution, solution: Option<&Solution>) -> NodeUpsert {
    let mut props = Props::new();
    props.insert("key".into(), Value::String(resolution.solution_key.clone()));
    props.insert("signature".into(), Value::String(resolution.signature.clone()));
    props.insert(
        "tool_sequence".into(),
        Value::from(resolution.tool_sequence.clone()),
    );
    if let Some(solution) = solution {
        props.insert("successes".into(), Value::from(solution.successes));
        props.insert("failures".into(), Value::from(solution.failures));
        props.insert("effectiveness".into(), Value::from(solution.effectiveness()));
        props.insert("first_seen".into(), Value::String(solution.first_seen.to_rfc3339()));
        props.insert("last_seen".into(), Value::String(solution.last_seen.to_rfc3339()));
    }
    NodeUpsert {
        kind: NodeKind::Solution,
        key: resolution.solution_key.clone(),
        props,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn log(payloads: Vec<RecordPayload>) -> Vec<LogRecord> {
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| LogRecord {
                session_id: "s1".into(),
                seq: i as u64 + 1,
                natural_key: payload.natural_key(),
                payload,
                created_at: at(0),
                synced: true,
            })
            .collect()
    }

    fn prompt(seq: u64) -> RecordPayload {
        RecordPayload::Prompt(Prompt {
            session_id: "s1".into(),
            seq,
            text: "fix it".into(),
            text_hash: String::new(),
            word_count: 2,
            timestamp: at(seq as i64),
            intent: Intent::Debug,
            keywords: vec![],
            task_id: Some("task:s1:1".into()),
        })
    }

    fn tool(seq: u64, path: &str, subagent: Option<&str>) -> RecordPayload {
        RecordPayload::ToolCall(ToolCall {
            call_id: format!("c{}", seq),
            session_id: "s1".into(),
            seq,
            tool_name: "Read".into(),
            tool_use_id: None,
            category: ToolCategory::FileOps,
            context: ToolContext::Exploration,
            input: "{}".into(),
            output: None,
            started_at: None,
            ended_at: Some(at(seq as i64)),
            duration_ms: None,
            success: Some(true),
            error: None,
            error_type: None,
            file_path: Some(path.into()),
            files: vec![FileAccess {
                path: path.into(),
                mode: AccessMode::Read,
                is_primary: true,
                is_expansion: false,
            }],
            origin: CallOrigin::Matched,
            task_id: Some("task:s1:1".into()),
            subagent_id: subagent.map(str::to_string),
        })
    }

    fn has(derived: &Derived, kind: EdgeKind, from: &str, to: &str) -> bool {
        derived
            .edges
            .iter()
            .any(|e| e.kind == kind && e.from == from && e.to == to)
    }

    fn edge<'a>(derived: &'a Derived, kind: EdgeKind, from: &str, to: &str) -> &'a EdgeUpsert {
        derived
            .edges
            .iter()
            .find(|e| e.kind == kind && e.from == from && e.to == to)
            .unwrap()
    }

    fn triggered(records: &[LogRecord], ctx: &DeriveContext) -> Vec<(String, String)> {
        records
            .iter()
            .flat_map(|r| derive_record(r, ctx, None).edges)
            .filter(|e| e.kind == EdgeKind::Triggered)
            .map(|e| (e.from, e.to))
            .collect()
    }

    fn timed_prompt(seq: u64, secs: i64) -> RecordPayload {
        let mut payload = prompt(seq);
        if let RecordPayload::Prompt(p) = &mut payload {
            p.timestamp = at(secs);
        }
        payload
    }

    #[test]
    fn test_tool_call_edges() {
        let records = log(vec![prompt(1), tool(1, "/a", None), tool(2, "/a", None)]);
        let ctx = DeriveContext::new(&records);

        let second = derive_record(&records[2], &ctx, None);
        assert!(has(&second, EdgeKind::FollowedBy, "tool:s1:1", "tool:s1:2"));
        assert!(has(&second, EdgeKind::BelongsToTask, "tool:s1:2", "task:s1:1"));
        assert!(has(&second, EdgeKind::AccessedFile, "tool:s1:2", "file:/a"));

        let rollup = second
            .edges
            .iter()
            .find(|e| e.kind == EdgeKind::SessionAccessed)
            .unwrap();
        assert_eq!(rollup.props["count"], serde_json::json!(2));
        assert_eq!(second.nodes[0].kind, NodeKind::File);
    }

    #[test]
    fn test_followed_by_carries_gap_and_same_file() {
        let records = log(vec![tool(1, "/a", None), tool(2, "/a", None), tool(3, "/b", None)]);
        let ctx = DeriveContext::new(&records);

        let second = derive_record(&records[1], &ctx, None);
        let step = edge(&second, EdgeKind::FollowedBy, "tool:s1:1", "tool:s1:2");
        assert_eq!(step.props["gap_ms"], serde_json::json!(1000));
        assert_eq!(step.props["same_file"], serde_json::json!(true));

        let third = derive_record(&records[2], &ctx, None);
        let step = edge(&third, EdgeKind::FollowedBy, "tool:s1:2", "tool:s1:3");
        assert_eq!(step.props["same_file"], serde_json::json!(false));
    }

    #[test]
    fn test_next_prompt_carries_gap() {
        let records = log(vec![timed_prompt(1, 10), timed_prompt(2, 25)]);
        let ctx = DeriveContext::new(&records);

        let derived = derive_record(&records[1], &ctx, None);
        let next = edge(&derived, EdgeKind::NextPrompt, "prompt:s1:1", "prompt:s1:2");
        assert_eq!(next.props["gap_ms"], serde_json::json!(15_000));
    }

    #[test]
    fn test_triggered_skips_call_with_equal_timestamp() {
        // Prompt at t=1; tool 1 also ends at t=1, tool 2 at t=2
        let records = log(vec![prompt(1), tool(1, "/a", None), tool(2, "/a", None), tool(3, "/a", None)]);
        let ctx = DeriveContext::new(&records);

        assert_eq!(
            triggered(&records, &ctx),
            vec![("prompt:s1:1".to_string(), "tool:s1:2".to_string())]
        );

        let second = derive_record(&records[2], &ctx, None);
        let link = edge(&second, EdgeKind::Triggered, "prompt:s1:1", "tool:s1:2");
        assert_eq!(link.props["gap_ms"], serde_json::json!(1000));
        assert_eq!(link.props["confidence"], serde_json::json!("high"));
    }

    #[test]
    fn test_each_prompt_triggers_at_most_one_call() {
        let records = log(vec![
            timed_prompt(1, 0),
            tool(1, "/a", None),
            timed_prompt(2, 5),
            tool(2, "/a", None),
            tool(6, "/a", None),
            tool(7, "/a", None),
            timed_prompt(3, 100),
        ]);
        let ctx = DeriveContext::new(&records);

        assert_eq!(
            triggered(&records, &ctx),
            vec![
                ("prompt:s1:1".to_string(), "tool:s1:1".to_string()),
                ("prompt:s1:2".to_string(), "tool:s1:6".to_string()),
            ]
        );
    }

    #[test]
    fn test_trigger_across_tasks_is_low_confidence() {
        let mut call = tool(2, "/a", None);
        if let RecordPayload::ToolCall(c) = &mut call {
            c.task_id = Some("task:s1:2".into());
        }
        let records = log(vec![prompt(1), call]);
        let ctx = DeriveContext::new(&records);

        let derived = derive_record(&records[1], &ctx, None);
        let link = edge(&derived, EdgeKind::Triggered, "prompt:s1:1", "tool:s1:2");
        assert_eq!(link.props["confidence"], serde_json::json!("low"));
    }

    #[test]
    fn test_subagent_calls_chain_within_subagent() {
        let records = log(vec![prompt(1), tool(1, "/x", Some("a1")), tool(2, "/y", Some("a1"))]);
        let ctx = DeriveContext::new(&records);

        let derived = derive_record(&records[2], &ctx, None);
        assert!(has(&derived, EdgeKind::PartOfSubagent, "subtool:s1:a1:2", "subagent:a1"));
        assert!(has(&derived, EdgeKind::FollowedBy, "subtool:s1:a1:1", "subtool:s1:a1:2"));
        assert!(!derived.edges.iter().any(|e| e.kind == EdgeKind::Triggered));
    }

    #[test]
    fn test_resolution_links_solution() {
        let resolution = ErrorResolution {
            error_key: "error:s1:1".into(),
            session_id: "s1".into(),
            resolved_by: "tool:s1:2".into(),
            resolved_at: at(5),
            solution_key: "solution:ab".into(),
            signature: "Read: not found".into(),
            tool_sequence: vec!["Read".into(), "Write".into()],
        };
        let records = log(vec![RecordPayload::ErrorResolved(resolution)]);
        let ctx = DeriveContext::new(&records);
        let solution = Solution {
            key: "solution:ab".into(),
            signature: "Read: not found".into(),
            tool_sequence: vec!["Read".into(), "Write".into()],
            successes: 3,
            failures: 1,
            first_seen: at(0),
            last_seen: at(5),
        };

        let derived = derive_record(&records[0], &ctx, Some(&solution));
        assert!(has(&derived, EdgeKind::ResolvedBy, "error:s1:1", "tool:s1:2"));
        assert!(has(&derived, EdgeKind::FixedBy, "error:s1:1", "solution:ab"));
        assert_eq!(derived.nodes[0].props["effectiveness"], serde_json::json!(0.75));
    }
}
