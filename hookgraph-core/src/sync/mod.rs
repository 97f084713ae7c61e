//! Graph synchronization
//!
//! Projects the durable log into a [`GraphStore`] in two phases per
//! session:
//!
//! 1. **Nodes**: each unsynced record becomes a node upsert, and the record
//!    is marked synced as soon as its write succeeds. The first failure
//!    stops the run; the next run resumes from the first unsynced record.
//! 2. **Edges**: records between the edge cursor and the node cursor get
//!    their derived relationships. The edge cursor advances per record.
//!
//! Graph trouble never reaches the hook path; it only delays projection.

pub mod derive;

use crate::config::GraphConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::graph::{record_node, EdgeUpsert, GraphStore, Neo4jHttpStore, NodeUpsert};
use crate::lock::SyncLock;
use crate::types::RecordPayload;
use derive::{derive_record, DeriveContext};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Timeouts, retries, locking
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Deadline for one store call
    pub timeout: Duration,
    /// Extra attempts for retryable failures
    pub max_retries: usize,
    /// Database path used to scope session locks; `None` disables locking
    pub lock_scope: Option<PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&GraphConfig::default())
    }
}

impl From<&GraphConfig> for SyncOptions {
    fn from(config: &GraphConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            lock_scope: None,
        }
    }
}

/// Outcome of one session's sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSyncReport {
    pub session_id: String,
    pub nodes: usize,
    pub edges: usize,
    /// Another run held the session lock
    pub skipped: bool,
    pub error: Option<String>,
}

/// Outcome of a multi-session sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub sessions: Vec<SessionSyncReport>,
}

impl SyncReport {
    pub fn nodes(&self) -> usize {
        self.sessions.iter().map(|s| s.nodes).sum()
    }

    pub fn edges(&self) -> usize {
        self.sessions.iter().map(|s| s.edges).sum()
    }

    pub fn failed(&self) -> usize {
        self.sessions.iter().filter(|s| s.error.is_some()).count()
    }
}

/// Projects the log into a graph store
pub struct Synchronizer {
    db: Arc<Database>,
    store: Arc<dyn GraphStore>,
    options: SyncOptions,
}

impl Synchronizer {
    pub fn new(db: Arc<Database>, store: Arc<dyn GraphStore>, options: SyncOptions) -> Self {
        Self { db, store, options }
    }

    /// Synchronizer against the configured Neo4j server.
    ///
    /// Returns None if graph sync is not enabled or not configured.
    pub fn from_config(
        db: Arc<Database>,
        config: &GraphConfig,
        db_path: Option<PathBuf>,
    ) -> Result<Option<Self>> {
        if !config.is_ready() {
            tracing::debug!("Graph sync not enabled or not configured");
            return Ok(None);
        }
        let store = Neo4jHttpStore::new(config)?;
        let options = SyncOptions {
            lock_scope: db_path,
            ..SyncOptions::from(config)
        };
        Ok(Some(Self::new(db, Arc::new(store), options)))
    }

    /// Sync every session with unsynced records or pending edges.
    ///
    /// A failing session is reported and the rest still run.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for session_id in self.db.sessions_with_unsynced()? {
            match self.sync_session(&session_id).await {
                Ok(session) => report.sessions.push(session),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Session sync failed");
                    report.sessions.push(SessionSyncReport {
                        session_id,
                        error: Some(e.to_string()),
                        ..Default::default()
                    });
                }
            }
        }
        Ok(report)
    }

    /// Project one session: nodes first, then derived edges.
    pub async fn sync_session(&self, session_id: &str) -> Result<SessionSyncReport> {
        let mut report = SessionSyncReport {
            session_id: session_id.to_string(),
            ..Default::default()
        };

        let _lock = match &self.options.lock_scope {
            Some(db_path) => match SyncLock::try_acquire(db_path, session_id)? {
                Some(lock) => Some(lock),
                None => {
                    tracing::info!(session_id, "Session sync already running elsewhere, skipping");
                    report.skipped = true;
                    return Ok(report);
                }
            },
            None => None,
        };

        report.nodes = self.sync_nodes(session_id).await?;
        report.edges = self.sync_edges(session_id).await?;

        if report.nodes > 0 || report.edges > 0 {
            tracing::info!(
                session_id,
                nodes = report.nodes,
                edges = report.edges,
                "Session synced"
            );
        }
        Ok(report)
    }

    async fn sync_nodes(&self, session_id: &str) -> Result<usize> {
        let mut written = 0;
        for record in self.db.read_unsynced(session_id)? {
            let node = record_node(&record.payload)?;
            self.upsert_node(&node).await?;
            self.db.mark_synced_through(session_id, record.seq)?;
            written += 1;
        }
        Ok(written)
    }

    async fn sync_edges(&self, session_id: &str) -> Result<usize> {
        let cursor = self.db.sync_cursor(session_id)?;
        if cursor.edge_seq >= cursor.node_seq {
            return Ok(0);
        }

        let records = self.db.read_session(session_id)?;
        let ctx = DeriveContext::new(&records);
        let mut written = 0;

        for record in records
            .iter()
            .filter(|r| r.seq > cursor.edge_seq && r.seq <= cursor.node_seq)
        {
            let solution = match &record.payload {
                RecordPayload::ErrorResolved(r) => self.db.solution(&r.solution_key)?,
                _ => None,
            };
            let derived = derive_record(record, &ctx, solution.as_ref());
            for node in &derived.nodes {
                self.upsert_node(node).await?;
            }
            for edge in &derived.edges {
                self.upsert_edge(edge).await?;
                written += 1;
            }
            self.db.set_edge_cursor(session_id, record.seq)?;
        }

        // Trailing quarantined records still count as processed
        if self.db.sync_cursor(session_id)?.edge_seq < cursor.node_seq {
            self.db.set_edge_cursor(session_id, cursor.node_seq)?;
        }
        Ok(written)
    }

    async fn upsert_node(&self, node: &NodeUpsert) -> Result<()> {
        self.with_retry("upsert_node", || self.store.upsert_node(node))
            .await
    }

    async fn upsert_edge(&self, edge: &EdgeUpsert) -> Result<()> {
        self.with_retry("upsert_edge", || self.store.upsert_edge(edge))
            .await
    }

    /// Run a store call under the deadline, retrying transient failures
    /// with exponential backoff.
    async fn with_retry<F, Fut>(&self, op_name: &str, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut last_error = None;
        let mut delay = Duration::from_millis(500);

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                tracing::debug!(
                    "Retrying {} (attempt {}/{}), waiting {:?}",
                    op_name,
                    attempt + 1,
                    self.options.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }

            let result = match tokio::time::timeout(self.options.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(self.options.timeout.as_millis() as u64)),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Transient error in {}: {}", op_name, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Graph("max retries exceeded".to_string())))
    }
}

/// Synchronous wrapper for [`Synchronizer`]
///
/// Owns a current-thread runtime so the sync binary and tests can stay
/// synchronous.
pub struct BlockingSynchronizer {
    inner: Synchronizer,
    runtime: tokio::runtime::Runtime,
}

impl BlockingSynchronizer {
    pub fn new(inner: Synchronizer) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Graph(format!("failed to create runtime: {}", e)))?;
        Ok(Self { inner, runtime })
    }

    pub fn sync_session(&self, session_id: &str) -> Result<SessionSyncReport> {
        self.runtime.block_on(self.inner.sync_session(session_id))
    }

    pub fn sync_all(&self) -> Result<SyncReport> {
        self.runtime.block_on(self.inner.sync_all())
    }
}
