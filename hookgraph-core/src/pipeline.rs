//! Event recording pipeline
//!
//! [`Recorder`] is what the hook binary drives: parse one payload, then
//! correlate, aggregate and append inside a single session transaction.

use crate::aggregate::{Aggregator, AggregatorConfig, Emitted, SessionState};
use crate::config::Config;
use crate::correlate::{CompletedCall, Correlator};
use crate::db::{Database, SessionTx};
use crate::error::Result;
use crate::event::{HookEvent, SubagentStop};
use crate::transcript::read_subagent_calls;
use crate::types::{keys, RecordPayload};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// What happened to one inbound payload
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Durable; `records` were appended to the log
    Recorded {
        session_id: String,
        kind: &'static str,
        records: usize,
    },
    /// Payload did not parse; nothing was written
    Rejected(String),
    /// Payload parsed but could not be stored
    Failed(String),
}

impl HookOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, HookOutcome::Recorded { .. })
    }
}

/// Turns hook events into durable log records
pub struct Recorder {
    db: Arc<Database>,
    correlator: Correlator,
    aggregator: Aggregator,
}

impl Recorder {
    pub fn new(db: Arc<Database>, config: &Config) -> Self {
        Self {
            db,
            correlator: Correlator::new(Duration::from_secs(config.correlator.pending_ttl_secs)),
            aggregator: Aggregator::new(AggregatorConfig::from(config)),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Process boundary: never fails, only reports.
    pub fn handle_raw(&self, raw: &str) -> HookOutcome {
        let event = match HookEvent::parse(raw, Utc::now()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected hook payload");
                return HookOutcome::Rejected(e.to_string());
            }
        };

        let session_id = event.session_id().to_string();
        let kind = event.kind_name();
        match self.record(event) {
            Ok(records) => {
                tracing::debug!(session_id = %session_id, kind, records, "Recorded hook event");
                HookOutcome::Recorded {
                    session_id,
                    kind,
                    records,
                }
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, kind, error = %e, "Failed to record hook event");
                HookOutcome::Failed(e.to_string())
            }
        }
    }

    /// Record one event; returns the number of records appended.
    pub fn record(&self, event: HookEvent) -> Result<usize> {
        let session_id = event.session_id().to_string();
        let now = event.timestamp();

        // File I/O stays outside the write transaction
        let subagent_calls = match &event {
            HookEvent::SubagentStop(stop) => self.subagent_calls(stop),
            _ => Vec::new(),
        };

        self.db.with_session(&session_id, |tx| {
            let (mut state, fresh) = match tx.load_state()? {
                Some(state) => (state, false),
                None => (SessionState::new(&session_id, now, event.cwd()), true),
            };

            let mut emitted = Emitted::default();
            if fresh && !matches!(event, HookEvent::SessionStart(_)) {
                tracing::debug!(session_id = %session_id, "Session created without SessionStart");
                emitted.records.push(self.aggregator.session_snapshot(&state));
            }

            for call in self.correlator.evict(tx, Some(&session_id), now)? {
                merge(&mut emitted, self.aggregator.on_tool_call(&mut state, call));
            }

            let step = match &event {
                HookEvent::SessionStart(e) => self.aggregator.on_session_start(&mut state, e),
                HookEvent::SessionEnd(e) => self.aggregator.on_session_end(&mut state, e),
                HookEvent::PromptSubmit(e) => self.aggregator.on_prompt(&mut state, e),
                HookEvent::ToolPre(e) => {
                    self.correlator.on_pre(tx, e)?;
                    Emitted::default()
                }
                HookEvent::ToolPost(e) => {
                    let call = self.correlator.on_post(tx, e)?;
                    self.aggregator.on_tool_call(&mut state, call)
                }
                HookEvent::SubagentStop(e) => {
                    self.aggregator.on_subagent(&mut state, e, subagent_calls)
                }
            };
            merge(&mut emitted, step);

            persist(tx, &state, emitted)
        })
    }

    /// Sweep expired pending halves in every session.
    ///
    /// Returns how many calls were surfaced as orphaned.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.correlator.ttl();
        let mut evicted = 0;

        for session_id in self.db.sessions_with_expired(cutoff)? {
            evicted += self.db.with_session(&session_id, |tx| {
                let calls = self.correlator.evict(tx, Some(&session_id), now)?;
                if calls.is_empty() {
                    return Ok(0);
                }
                let count = calls.len();
                let (mut state, mut emitted) = match tx.load_state()? {
                    Some(state) => (state, Emitted::default()),
                    None => {
                        let first = calls
                            .iter()
                            .filter_map(|c| c.started_at)
                            .min()
                            .unwrap_or(now);
                        let state = SessionState::new(&session_id, first, None);
                        let mut emitted = Emitted::default();
                        emitted.records.push(self.aggregator.session_snapshot(&state));
                        (state, emitted)
                    }
                };
                for call in calls {
                    merge(&mut emitted, self.aggregator.on_tool_call(&mut state, call));
                }
                persist(tx, &state, emitted)?;
                Ok(count)
            })?;
        }

        if evicted > 0 {
            tracing::info!(evicted, "Swept expired pending tool calls");
        }
        Ok(evicted)
    }

    fn subagent_calls(&self, stop: &SubagentStop) -> Vec<CompletedCall> {
        let Some(path) = &stop.transcript_path else {
            return Vec::new();
        };
        match read_subagent_calls(path, &stop.session_id, &stop.agent_id) {
            Ok(calls) => calls,
            Err(e) => {
                tracing::warn!(agent_id = %stop.agent_id, error = %e, "Could not read subagent transcript");
                Vec::new()
            }
        }
    }
}

fn merge(into: &mut Emitted, from: Emitted) {
    into.records.extend(from.records);
    into.solutions.extend(from.solutions);
}

/// Append emitted records, apply solution updates, save state.
fn persist(tx: &SessionTx<'_>, state: &SessionState, emitted: Emitted) -> Result<usize> {
    let now = Utc::now();
    for record in &emitted.records {
        let seq = tx.append(record, now)?;
        tracing::trace!(
            session_id = %tx.session_id(),
            seq,
            kind = record.kind().as_str(),
            "Appended record"
        );
        if let RecordPayload::ToolCall(call) = record {
            if !call.files.is_empty() {
                tx.record_file_accesses(&keys::tool_call(call), call.timestamp(), &call.files)?;
            }
        }
    }
    for update in &emitted.solutions {
        tx.apply_solution_update(update)?;
    }
    tx.save_state(state)?;
    Ok(emitted.records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallOrigin, RecordKind};

    fn recorder() -> Recorder {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        Recorder::new(Arc::new(db), &Config::default())
    }

    fn kinds(recorder: &Recorder, session: &str) -> Vec<RecordKind> {
        recorder
            .db()
            .read_session(session)
            .unwrap()
            .iter()
            .map(|r| r.kind())
            .collect()
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let recorder = recorder();
        let outcome = recorder.handle_raw(r#"{"hook_event_name":"PreToolUse"}"#);
        assert!(matches!(outcome, HookOutcome::Rejected(_)));
        assert!(matches!(recorder.handle_raw("not json"), HookOutcome::Rejected(_)));
        assert_eq!(recorder.db().log_stats().unwrap().records, 0);
    }

    #[test]
    fn test_pre_post_produce_one_tool_call() {
        let recorder = recorder();
        let pre = r#"{"hook_event_name":"PreToolUse","session_id":"s1","tool_name":"Read","tool_use_id":"t1","tool_input":{"file_path":"/a.rs"},"timestamp":"2025-01-01T00:00:00Z"}"#;
        let post = r#"{"hook_event_name":"PostToolUse","session_id":"s1","tool_name":"Read","tool_use_id":"t1","tool_input":{"file_path":"/a.rs"},"tool_response":"fn main() {}","timestamp":"2025-01-01T00:00:01.250Z"}"#;

        assert!(recorder.handle_raw(pre).is_recorded());
        assert!(recorder.handle_raw(post).is_recorded());

        assert_eq!(
            kinds(&recorder, "s1"),
            vec![RecordKind::Session, RecordKind::Task, RecordKind::ToolCall]
        );
        let records = recorder.db().read_session("s1").unwrap();
        let RecordPayload::ToolCall(call) = &records[2].payload else {
            panic!("expected tool call");
        };
        assert_eq!(call.duration_ms, Some(1250));
        assert_eq!(call.origin, CallOrigin::Matched);
        assert_eq!(recorder.db().file_accesses("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_expired_pre_surfaces_once() {
        let recorder = recorder();
        let pre = r#"{"hook_event_name":"PreToolUse","session_id":"s1","tool_name":"Bash","tool_input":{"command":"sleep 999"},"timestamp":"2025-01-01T00:00:00Z"}"#;
        recorder.handle_raw(pre);

        let later = DateTime::parse_from_rfc3339("2025-01-01T01:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(recorder.evict_expired(later).unwrap(), 1);
        assert_eq!(recorder.evict_expired(later).unwrap(), 0);

        let orphans: Vec<_> = recorder
            .db()
            .read_session("s1")
            .unwrap()
            .into_iter()
            .filter_map(|r| match r.payload {
                RecordPayload::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].origin, CallOrigin::OrphanedPre);
        assert_eq!(orphans[0].success, None);
    }
}
