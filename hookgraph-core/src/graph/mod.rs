//! Graph store abstraction
//!
//! The log is projected into a property graph where every node is merged on
//! its natural key. Writes are idempotent upserts, so replaying a record or
//! an edge never duplicates anything.

pub mod memory;
pub mod neo4j;

pub use memory::MemoryGraphStore;
pub use neo4j::Neo4jHttpStore;

use crate::error::Result;
use crate::types::RecordPayload;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Flat node or edge properties
pub type Props = Map<String, Value>;

/// Node labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    Session,
    Prompt,
    ToolCall,
    Task,
    ErrorInstance,
    Solution,
    Subagent,
    Metrics,
    File,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Session => "Session",
            NodeKind::Prompt => "Prompt",
            NodeKind::ToolCall => "ToolCall",
            NodeKind::Task => "Task",
            NodeKind::ErrorInstance => "ErrorInstance",
            NodeKind::Solution => "Solution",
            NodeKind::Subagent => "Subagent",
            NodeKind::Metrics => "Metrics",
            NodeKind::File => "File",
        }
    }
}

/// Relationship types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    /// Consecutive tool calls of one owner
    FollowedBy,
    /// Consecutive prompts
    NextPrompt,
    /// Prompt to the calls made while answering it
    Triggered,
    BelongsToTask,
    PartOfSession,
    AccessedFile,
    PartOfSubagent,
    ChildOfSession,
    TriggeredSubagent,
    ProducedError,
    ResolvedBy,
    FixedBy,
    Summarizes,
    /// Session-level file rollup with an access count
    SessionAccessed,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::FollowedBy => "FOLLOWED_BY",
            EdgeKind::NextPrompt => "NEXT_PROMPT",
            EdgeKind::Triggered => "TRIGGERED",
            EdgeKind::BelongsToTask => "BELONGS_TO_TASK",
            EdgeKind::PartOfSession => "PART_OF_SESSION",
            EdgeKind::AccessedFile => "ACCESSED_FILE",
            EdgeKind::PartOfSubagent => "PART_OF_SUBAGENT",
            EdgeKind::ChildOfSession => "CHILD_OF_SESSION",
            EdgeKind::TriggeredSubagent => "TRIGGERED_SUBAGENT",
            EdgeKind::ProducedError => "PRODUCED_ERROR",
            EdgeKind::ResolvedBy => "RESOLVED_BY",
            EdgeKind::FixedBy => "FIXED_BY",
            EdgeKind::Summarizes => "SUMMARIZES",
            EdgeKind::SessionAccessed => "SESSION_ACCESSED",
        }
    }
}

/// A node write
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpsert {
    pub kind: NodeKind,
    pub key: String,
    pub props: Props,
}

/// An edge write; both endpoints are natural keys
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeUpsert {
    pub kind: EdgeKind,
    pub from: String,
    pub to: String,
    pub props: Props,
}

impl EdgeUpsert {
    pub fn new(kind: EdgeKind, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            props: Props::new(),
        }
    }

    pub fn with_prop(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.props.insert(name.to_string(), value.into());
        self
    }
}

/// Idempotent graph writes
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Merge a node on its key and overwrite the given properties.
    async fn upsert_node(&self, node: &NodeUpsert) -> Result<()>;

    /// Merge an edge between two keyed nodes and overwrite its properties.
    async fn upsert_edge(&self, edge: &EdgeUpsert) -> Result<()>;
}

/// Drop nulls and encode nested values as JSON text.
///
/// Graph properties must be scalars or lists of scalars.
pub fn flatten_props(value: Value) -> Props {
    let Value::Object(map) = value else {
        return Props::new();
    };
    map.into_iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::Object(_) => Some((k, Value::String(v.to_string()))),
            Value::Array(ref items) if items.iter().any(|i| i.is_object() || i.is_array()) => {
                Some((k, Value::String(v.to_string())))
            }
            other => Some((k, other)),
        })
        .collect()
}

/// The node a log record writes.
///
/// A resolution record updates the ErrorInstance it resolves rather than
/// adding a node of its own.
pub fn record_node(payload: &RecordPayload) -> Result<NodeUpsert> {
    let key = payload.natural_key();
    let (kind, mut props) = match payload {
        RecordPayload::Session(s) => (NodeKind::Session, flatten_props(serde_json::to_value(s)?)),
        RecordPayload::Prompt(p) => (NodeKind::Prompt, flatten_props(serde_json::to_value(p)?)),
        RecordPayload::ToolCall(t) => {
            let mut props = flatten_props(serde_json::to_value(t)?);
            // Files become nodes of their own
            props.remove("files");
            (NodeKind::ToolCall, props)
        }
        RecordPayload::Task(t) => (NodeKind::Task, flatten_props(serde_json::to_value(t)?)),
        RecordPayload::ErrorInstance(e) => (
            NodeKind::ErrorInstance,
            flatten_props(serde_json::to_value(e)?),
        ),
        RecordPayload::ErrorResolved(r) => {
            let mut props = Props::new();
            props.insert("resolved".into(), Value::Bool(true));
            props.insert("resolved_at".into(), Value::String(r.resolved_at.to_rfc3339()));
            props.insert("resolved_by".into(), Value::String(r.resolved_by.clone()));
            props.insert("solution_key".into(), Value::String(r.solution_key.clone()));
            (NodeKind::ErrorInstance, props)
        }
        RecordPayload::Subagent(a) => (NodeKind::Subagent, flatten_props(serde_json::to_value(a)?)),
        RecordPayload::Metrics(m) => (NodeKind::Metrics, flatten_props(serde_json::to_value(m)?)),
    };
    props.insert("key".into(), Value::String(key.clone()));
    Ok(NodeUpsert { kind, key, props })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorResolution;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_flatten_props() {
        let props = flatten_props(json!({
            "a": 1,
            "b": null,
            "c": {"x": 1},
            "d": ["p", "q"],
            "e": [{"x": 1}],
        }));
        assert_eq!(props["a"], json!(1));
        assert!(!props.contains_key("b"));
        assert_eq!(props["c"], json!("{\"x\":1}"));
        assert_eq!(props["d"], json!(["p", "q"]));
        assert!(props["e"].is_string());
    }

    #[test]
    fn test_resolution_updates_error_node() {
        let node = record_node(&RecordPayload::ErrorResolved(ErrorResolution {
            error_key: "error:s1:3".into(),
            session_id: "s1".into(),
            resolved_by: "tool:s1:5".into(),
            resolved_at: Utc::now(),
            solution_key: "solution:ab".into(),
            signature: "Read: not found".into(),
            tool_sequence: vec!["Read".into()],
        }))
        .unwrap();
        assert_eq!(node.kind, NodeKind::ErrorInstance);
        assert_eq!(node.key, "error:s1:3");
        assert_eq!(node.props["resolved"], json!(true));
    }

    #[test]
    fn test_edge_names() {
        assert_eq!(EdgeKind::SessionAccessed.as_str(), "SESSION_ACCESSED");
        let edge = EdgeUpsert::new(EdgeKind::FixedBy, "error:s1:1", "solution:ab").with_prop("at", "x");
        assert_eq!(edge.props["at"], json!("x"));
    }
}
