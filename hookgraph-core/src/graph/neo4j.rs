//! Neo4j graph store over the transactional HTTP endpoint
//!
//! Every write is a single auto-committed Cypher statement:
//!
//! ```text
//! POST {uri}/db/{database}/tx/commit
//! {"statements": [{"statement": "...", "parameters": {...}}]}
//! ```

use super::{EdgeUpsert, GraphStore, NodeUpsert};
use crate::config::GraphConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Every node carries this label so keys are unique across kinds
const BASE_LABEL: &str = "HookNode";

#[derive(Serialize)]
struct CommitRequest<'a> {
    statements: [Statement<'a>; 1],
}

#[derive(Serialize)]
struct Statement<'a> {
    statement: &'a str,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    errors: Vec<CypherError>,
}

#[derive(Debug, Deserialize)]
struct CypherError {
    code: String,
    message: String,
}

/// HTTP client for a Neo4j server
pub struct Neo4jHttpStore {
    http_client: reqwest::Client,
    commit_url: String,
    user: Option<String>,
    password: Option<String>,
}

impl Neo4jHttpStore {
    /// Build a store from configuration.
    ///
    /// Fails if the configuration is invalid or has no URI.
    pub fn new(config: &GraphConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .uri
            .as_deref()
            .ok_or_else(|| Error::Config("graph.uri is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            commit_url: format!(
                "{}/db/{}/tx/commit",
                base_url,
                urlencoding::encode(&config.database)
            ),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    async fn run(&self, statement: &str, parameters: Value) -> Result<()> {
        let body = CommitRequest {
            statements: [Statement {
                statement,
                parameters,
            }],
        };

        let mut request = self.http_client.post(&self.commit_url).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Graph(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(Error::Graph(format!("API error ({}): {}", status, error_text)));
        }

        let result: CommitResponse = response
            .json()
            .await
            .map_err(|e| Error::Graph(format!("failed to parse response: {}", e)))?;

        match result.errors.first() {
            None => Ok(()),
            Some(err) => {
                // Neo4j marks retryable failures with a Transient classification
                let transient = if err.code.contains(".TransientError.") {
                    " (transient)"
                } else {
                    ""
                };
                Err(Error::Graph(format!("{}: {}{}", err.code, err.message, transient)))
            }
        }
    }
}

/// Labels and relationship types cannot be parameters; only our own
/// fixed identifiers are ever interpolated.
fn node_statement(label: &str) -> String {
    format!(
        "MERGE (n:{base} {{key: $key}}) SET n:{label} SET n += $props",
        base = BASE_LABEL,
        label = label
    )
}

fn edge_statement(rel: &str) -> String {
    format!(
        "MERGE (a:{base} {{key: $from}}) \
         MERGE (b:{base} {{key: $to}}) \
         MERGE (a)-[r:{rel}]->(b) SET r += $props",
        base = BASE_LABEL,
        rel = rel
    )
}

#[async_trait]
impl GraphStore for Neo4jHttpStore {
    async fn upsert_node(&self, node: &NodeUpsert) -> Result<()> {
        self.run(
            &node_statement(node.kind.as_str()),
            json!({ "key": node.key, "props": node.props }),
        )
        .await
    }

    async fn upsert_edge(&self, edge: &EdgeUpsert) -> Result<()> {
        self.run(
            &edge_statement(edge.kind.as_str()),
            json!({ "from": edge.from, "to": edge.to, "props": edge.props }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_requires_uri() {
        let config = GraphConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(Neo4jHttpStore::new(&config).is_err());
    }

    #[test]
    fn test_commit_url() {
        let config = GraphConfig {
            enabled: true,
            uri: Some("http://localhost:7474/".to_string()),
            database: "team graph".to_string(),
            ..Default::default()
        };
        let store = Neo4jHttpStore::new(&config).unwrap();
        assert_eq!(
            store.commit_url,
            "http://localhost:7474/db/team%20graph/tx/commit"
        );
    }

    #[test]
    fn test_statements() {
        assert_eq!(
            node_statement("Prompt"),
            "MERGE (n:HookNode {key: $key}) SET n:Prompt SET n += $props"
        );
        assert!(edge_statement("FOLLOWED_BY").contains("MERGE (a)-[r:FOLLOWED_BY]->(b)"));
    }

    #[test]
    fn test_transient_errors_retryable() {
        let err = Error::Graph(
            "Neo.TransientError.Transaction.DeadlockDetected: deadlock (transient)".to_string(),
        );
        assert!(err.is_retryable());
        let err = Error::Graph("Neo.ClientError.Statement.SyntaxError: bad".to_string());
        assert!(!err.is_retryable());
    }
}
