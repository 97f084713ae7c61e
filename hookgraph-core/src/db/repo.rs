//! Database repository layer
//!
//! Writes happen inside [`SessionTx`], one IMMEDIATE transaction per hook
//! event, so the pending index, the aggregate state and the appended
//! records commit together. Reads go straight through [`Database`].

use crate::aggregate::{SessionState, SolutionOutcome, SolutionUpdate};
use crate::config::StoreConfig;
use crate::correlate::PendingIndex;
use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// `synced` column values
const UNSYNCED: i64 = 0;
const SYNCED: i64 = 1;
/// Row failed its checksum or could not be decoded
const QUARANTINED: i64 = 2;

/// Timestamps are stored with fixed precision so they sort as text.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn checksum(kind: &str, natural_key: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(natural_key.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// A file access row as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFileAccess {
    pub session_id: String,
    /// Natural key of the tool call
    pub tool_key: String,
    pub access: FileAccess,
    pub accessed_at: Option<DateTime<Utc>>,
}

/// Row counts for `hookgraph-sync --stats`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    pub sessions: u64,
    pub records: u64,
    pub unsynced: u64,
    pub quarantined: u64,
    pub pending_calls: u64,
    pub solutions: u64,
}

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &StoreConfig::default())
    }

    /// Open with explicit store settings
    pub fn open_with(path: &Path, config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Hook processes for the same session may run concurrently
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Run `f` in one write transaction scoped to a session.
    ///
    /// Commits when `f` returns Ok; any error rolls everything back.
    pub fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionTx<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut session = SessionTx {
            tx,
            session_id: session_id.to_string(),
        };
        let value = f(&mut session)?;
        session.tx.commit()?;
        Ok(value)
    }

    // ============================================
    // Log reads
    // ============================================

    /// Every intact record of a session, in order.
    pub fn read_session(&self, session_id: &str) -> Result<Vec<LogRecord>> {
        self.read_records(session_id, false)
    }

    /// Records not yet projected, in order.
    ///
    /// Rows that fail their checksum are quarantined and left out.
    pub fn read_unsynced(&self, session_id: &str) -> Result<Vec<LogRecord>> {
        self.read_records(session_id, true)
    }

    fn read_records(&self, session_id: &str, unsynced_only: bool) -> Result<Vec<LogRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = if unsynced_only {
            "SELECT * FROM records WHERE session_id = ?1 AND synced = 0 ORDER BY seq"
        } else {
            "SELECT * FROM records WHERE session_id = ?1 AND synced != 2 ORDER BY seq"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([session_id], Self::row_to_raw)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for raw in rows {
            match raw.decode() {
                Ok(record) => records.push(record),
                Err(reason) => {
                    tracing::warn!(
                        session_id = %raw.session_id,
                        seq = raw.seq,
                        reason = %reason,
                        "Quarantining corrupt log record"
                    );
                    conn.execute(
                        "UPDATE records SET synced = ?3 WHERE session_id = ?1 AND seq = ?2",
                        params![raw.session_id, raw.seq as i64, QUARANTINED],
                    )?;
                }
            }
        }
        Ok(records)
    }

    fn row_to_raw(row: &Row) -> rusqlite::Result<RawRecord> {
        let seq: i64 = row.get("seq")?;
        let synced: i64 = row.get("synced")?;
        Ok(RawRecord {
            session_id: row.get("session_id")?,
            seq: seq as u64,
            kind: row.get("kind")?,
            natural_key: row.get("natural_key")?,
            payload: row.get("payload")?,
            checksum: row.get("checksum")?,
            created_at: row.get("created_at")?,
            synced: synced == SYNCED,
        })
    }

    /// Highest seq in a session's log, 0 when empty.
    pub fn last_seq(&self, session_id: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM records WHERE session_id = ?",
            [session_id],
            |r| r.get(0),
        )?;
        Ok(seq as u64)
    }

    // ============================================
    // Sync progress
    // ============================================

    /// Flag records up to `seq` as projected and advance the node cursor.
    pub fn mark_synced_through(&self, session_id: &str, seq: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE records SET synced = ?3 WHERE session_id = ?1 AND seq <= ?2 AND synced = ?4",
            params![session_id, seq as i64, SYNCED, UNSYNCED],
        )?;
        conn.execute(
            r#"
            INSERT INTO sync_cursors (session_id, node_seq, edge_seq, updated_at)
            VALUES (?1, ?2, 0, ?3)
            ON CONFLICT(session_id) DO UPDATE SET
                node_seq = MAX(node_seq, excluded.node_seq),
                updated_at = excluded.updated_at
            "#,
            params![session_id, seq as i64, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Record that derived edges are in place through `seq`.
    pub fn set_edge_cursor(&self, session_id: &str, seq: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sync_cursors (session_id, node_seq, edge_seq, updated_at)
            VALUES (?1, 0, ?2, ?3)
            ON CONFLICT(session_id) DO UPDATE SET
                edge_seq = excluded.edge_seq,
                updated_at = excluded.updated_at
            "#,
            params![session_id, seq as i64, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn sync_cursor(&self, session_id: &str) -> Result<SyncCursor> {
        let conn = self.conn.lock().unwrap();
        let cursor = conn
            .query_row(
                "SELECT node_seq, edge_seq FROM sync_cursors WHERE session_id = ?",
                [session_id],
                |r| {
                    let node: i64 = r.get(0)?;
                    let edge: i64 = r.get(1)?;
                    Ok(SyncCursor {
                        node_seq: node as u64,
                        edge_seq: edge as u64,
                    })
                },
            )
            .optional()?;
        Ok(cursor.unwrap_or_default())
    }

    /// Sessions with records or derived edges still to project.
    pub fn sessions_with_unsynced(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id FROM records WHERE synced = 0
            UNION
            SELECT session_id FROM sync_cursors WHERE edge_seq < node_seq
            ORDER BY 1
            "#,
        )?;
        let sessions = stmt
            .query_map([], |r| r.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(sessions)
    }

    // ============================================
    // Pending calls
    // ============================================

    pub fn pending_call(&self, call_id: &str) -> Result<Option<PendingCall>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM pending_calls WHERE call_id = ?",
            [call_id],
            row_to_pending,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Sessions holding a "before" half older than `cutoff`.
    pub fn sessions_with_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT session_id FROM pending_calls WHERE started_at < ? ORDER BY 1",
        )?;
        let sessions = stmt
            .query_map([fmt_ts(cutoff)], |r| r.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(sessions)
    }

    // ============================================
    // Derived tables
    // ============================================

    pub fn solution(&self, key: &str) -> Result<Option<Solution>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM solutions WHERE key = ?",
            [key],
            Self::row_to_solution,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_solution(row: &Row) -> rusqlite::Result<Solution> {
        let sequence: String = row.get("tool_sequence")?;
        let successes: i64 = row.get("successes")?;
        let failures: i64 = row.get("failures")?;
        let first_seen: String = row.get("first_seen")?;
        let last_seen: String = row.get("last_seen")?;

        Ok(Solution {
            key: row.get("key")?,
            signature: row.get("signature")?,
            tool_sequence: serde_json::from_str(&sequence).unwrap_or_default(),
            successes: successes as u64,
            failures: failures as u64,
            first_seen: parse_ts(&first_seen).unwrap_or_else(Utc::now),
            last_seen: parse_ts(&last_seen).unwrap_or_else(Utc::now),
        })
    }

    pub fn file_accesses(&self, session_id: &str) -> Result<Vec<StoredFileAccess>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM file_accesses WHERE session_id = ? ORDER BY id")?;
        let rows = stmt
            .query_map([session_id], |row| {
                let mode: String = row.get("access_mode")?;
                let accessed_at: Option<String> = row.get("accessed_at")?;
                Ok(StoredFileAccess {
                    session_id: row.get("session_id")?,
                    tool_key: row.get("tool_key")?,
                    access: FileAccess {
                        path: row.get("path")?,
                        mode: mode.parse().unwrap_or(AccessMode::Read),
                        is_primary: row.get("is_primary")?,
                        is_expansion: row.get("is_expansion")?,
                    },
                    accessed_at: accessed_at.as_deref().and_then(parse_ts),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn log_stats(&self) -> Result<LogStats> {
        let conn = self.conn.lock().unwrap();
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = conn.query_row(sql, [], |r| r.get(0))?;
            Ok(n as u64)
        };
        Ok(LogStats {
            sessions: count("SELECT COUNT(DISTINCT session_id) FROM records")?,
            records: count("SELECT COUNT(*) FROM records")?,
            unsynced: count("SELECT COUNT(*) FROM records WHERE synced = 0")?,
            quarantined: count("SELECT COUNT(*) FROM records WHERE synced = 2")?,
            pending_calls: count("SELECT COUNT(*) FROM pending_calls")?,
            solutions: count("SELECT COUNT(*) FROM solutions")?,
        })
    }
}

/// Undecoded `records` row
struct RawRecord {
    session_id: String,
    seq: u64,
    kind: String,
    natural_key: String,
    payload: String,
    checksum: String,
    created_at: String,
    synced: bool,
}

impl RawRecord {
    fn decode(&self) -> std::result::Result<LogRecord, String> {
        if checksum(&self.kind, &self.natural_key, &self.payload) != self.checksum {
            return Err("checksum mismatch".to_string());
        }
        let payload: RecordPayload =
            serde_json::from_str(&self.payload).map_err(|e| e.to_string())?;
        if payload.kind().as_str() != self.kind {
            return Err(format!("kind {} does not match payload", self.kind));
        }
        Ok(LogRecord {
            session_id: self.session_id.clone(),
            seq: self.seq,
            natural_key: self.natural_key.clone(),
            payload,
            created_at: parse_ts(&self.created_at).unwrap_or_else(Utc::now),
            synced: self.synced,
        })
    }
}

fn row_to_pending(row: &Row) -> rusqlite::Result<PendingCall> {
    let input: String = row.get("input")?;
    let started_at: String = row.get("started_at")?;
    Ok(PendingCall {
        call_id: row.get("call_id")?,
        session_id: row.get("session_id")?,
        tool_name: row.get("tool_name")?,
        tool_use_id: row.get("tool_use_id")?,
        input: serde_json::from_str(&input).unwrap_or(serde_json::Value::Null),
        started_at: parse_ts(&started_at).unwrap_or_else(Utc::now),
    })
}

// ============================================
// Session transaction
// ============================================

/// Write access to one session inside an open transaction
pub struct SessionTx<'c> {
    tx: rusqlite::Transaction<'c>,
    session_id: String,
}

impl SessionTx<'_> {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn load_state(&self) -> Result<Option<SessionState>> {
        let state: Option<String> = self
            .tx
            .query_row(
                "SELECT state FROM session_state WHERE session_id = ?",
                [&self.session_id],
                |r| r.get(0),
            )
            .optional()?;
        state
            .map(|s| serde_json::from_str(&s).map_err(Error::from))
            .transpose()
    }

    pub fn save_state(&self, state: &SessionState) -> Result<()> {
        self.tx.execute(
            r#"
            INSERT INTO session_state (session_id, state, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(session_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
            params![
                self.session_id,
                serde_json::to_string(state)?,
                fmt_ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Append a record at the next seq and return that seq.
    pub fn append(&self, payload: &RecordPayload, created_at: DateTime<Utc>) -> Result<u64> {
        let seq: i64 = self.tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM records WHERE session_id = ?",
            [&self.session_id],
            |r| r.get(0),
        )?;
        let kind = payload.kind().as_str();
        let natural_key = payload.natural_key();
        let body = serde_json::to_string(payload)?;
        let sum = checksum(kind, &natural_key, &body);

        self.tx.execute(
            r#"
            INSERT INTO records (session_id, seq, kind, natural_key, payload, checksum, created_at, synced)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
            "#,
            params![
                self.session_id,
                seq,
                kind,
                natural_key,
                body,
                sum,
                fmt_ts(created_at)
            ],
        )?;
        Ok(seq as u64)
    }

    pub fn record_file_accesses(
        &self,
        tool_key: &str,
        accessed_at: Option<DateTime<Utc>>,
        files: &[FileAccess],
    ) -> Result<()> {
        let mut stmt = self.tx.prepare_cached(
            r#"
            INSERT INTO file_accesses (session_id, tool_key, path, access_mode, is_primary, is_expansion, accessed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )?;
        for file in files {
            stmt.execute(params![
                self.session_id,
                tool_key,
                file.path,
                file.mode.as_str(),
                file.is_primary,
                file.is_expansion,
                accessed_at.map(fmt_ts),
            ])?;
        }
        Ok(())
    }

    /// Bump a solution's success or failure counter, creating it if needed.
    pub fn apply_solution_update(&self, update: &SolutionUpdate) -> Result<()> {
        let (successes, failures) = match update.outcome {
            SolutionOutcome::Success => (1, 0),
            SolutionOutcome::Failure => (0, 1),
        };
        self.tx.execute(
            r#"
            INSERT INTO solutions (key, signature, tool_sequence, successes, failures, first_seen, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(key) DO UPDATE SET
                successes = successes + excluded.successes,
                failures = failures + excluded.failures,
                last_seen = excluded.last_seen
            "#,
            params![
                update.key,
                update.signature,
                serde_json::to_string(&update.tool_sequence)?,
                successes,
                failures,
                fmt_ts(update.at),
            ],
        )?;
        Ok(())
    }

    fn select_pending(&self, call_id: &str) -> Result<Option<PendingCall>> {
        self.tx
            .query_row(
                "SELECT * FROM pending_calls WHERE call_id = ?",
                [call_id],
                row_to_pending,
            )
            .optional()
            .map_err(Error::from)
    }
}

impl PendingIndex for SessionTx<'_> {
    fn put(&mut self, half: PendingCall) -> Result<Option<PendingCall>> {
        let replaced = self.select_pending(&half.call_id)?;
        self.tx.execute(
            r#"
            INSERT OR REPLACE INTO pending_calls (call_id, session_id, tool_name, tool_use_id, input, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                half.call_id,
                half.session_id,
                half.tool_name,
                half.tool_use_id,
                half.input.to_string(),
                fmt_ts(half.started_at),
            ],
        )?;
        Ok(replaced)
    }

    fn take(&mut self, call_id: &str) -> Result<Option<PendingCall>> {
        let found = self.select_pending(call_id)?;
        if found.is_some() {
            self.tx
                .execute("DELETE FROM pending_calls WHERE call_id = ?", [call_id])?;
        }
        Ok(found)
    }

    fn take_expired(
        &mut self,
        session_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingCall>> {
        let cutoff = fmt_ts(cutoff);
        let expired = {
            let mut stmt = self.tx.prepare(
                r#"
                SELECT * FROM pending_calls
                WHERE started_at < ?1 AND (?2 IS NULL OR session_id = ?2)
                ORDER BY started_at, call_id
                "#,
            )?;
            let rows = stmt
                .query_map(params![cutoff, session_id], row_to_pending)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        for half in &expired {
            self.tx
                .execute("DELETE FROM pending_calls WHERE call_id = ?", [&half.call_id])?;
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::SessionState;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn session_record(id: &str) -> RecordPayload {
        RecordPayload::Session(SessionState::new(id, at(0), Some("/p")).session)
    }

    fn half(call_id: &str, session: &str, secs: i64) -> PendingCall {
        PendingCall {
            call_id: call_id.to_string(),
            session_id: session.to_string(),
            tool_name: "Read".to_string(),
            tool_use_id: None,
            input: serde_json::json!({"file_path": "/a"}),
            started_at: at(secs),
        }
    }

    #[test]
    fn test_append_gap_free_per_session() {
        let db = test_db();
        for _ in 0..3 {
            db.with_session("s1", |tx| tx.append(&session_record("s1"), at(0)))
                .unwrap();
        }
        db.with_session("s2", |tx| tx.append(&session_record("s2"), at(0)))
            .unwrap();

        let seqs: Vec<u64> = db.read_session("s1").unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(db.last_seq("s2").unwrap(), 1);
        assert_eq!(db.read_session("s1").unwrap()[0].natural_key, "session:s1");
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = test_db();
        let result: Result<()> = db.with_session("s1", |tx| {
            tx.append(&session_record("s1"), at(0))?;
            tx.put(half("c1", "s1", 0))?;
            Err(Error::Config("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(db.read_session("s1").unwrap().is_empty());
        assert!(db.pending_call("c1").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_quarantined() {
        let db = test_db();
        db.with_session("s1", |tx| {
            tx.append(&session_record("s1"), at(0))?;
            tx.append(&session_record("s1"), at(1))
        })
        .unwrap();
        db.connection()
            .execute(
                "UPDATE records SET payload = '{}' WHERE session_id = 's1' AND seq = 1",
                [],
            )
            .unwrap();

        let unsynced = db.read_unsynced("s1").unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].seq, 2);
        assert_eq!(db.log_stats().unwrap().quarantined, 1);
    }

    #[test]
    fn test_sync_cursor_progress() {
        let db = test_db();
        db.with_session("s1", |tx| {
            for i in 0..4 {
                tx.append(&session_record("s1"), at(i))?;
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(db.sessions_with_unsynced().unwrap(), vec!["s1"]);
        db.mark_synced_through("s1", 4).unwrap();
        assert!(db.read_unsynced("s1").unwrap().is_empty());

        // Nodes done but edges behind still needs a pass
        assert_eq!(db.sessions_with_unsynced().unwrap(), vec!["s1"]);
        db.set_edge_cursor("s1", 4).unwrap();
        assert!(db.sessions_with_unsynced().unwrap().is_empty());

        // Node cursor never moves backwards
        db.mark_synced_through("s1", 2).unwrap();
        assert_eq!(
            db.sync_cursor("s1").unwrap(),
            SyncCursor {
                node_seq: 4,
                edge_seq: 4
            }
        );
    }

    #[test]
    fn test_pending_index_in_transaction() {
        let db = test_db();
        db.with_session("s1", |tx| {
            assert!(tx.put(half("c1", "s1", 0))?.is_none());
            assert!(tx.put(half("c1", "s1", 5))?.is_some());
            tx.put(half("c2", "s1", 10))?;
            Ok(())
        })
        .unwrap();
        db.with_session("s2", |tx| tx.put(half("c3", "s2", 0)).map(|_| ()))
            .unwrap();

        assert_eq!(db.pending_call("c1").unwrap().unwrap().started_at, at(5));
        assert_eq!(db.sessions_with_expired(at(8)).unwrap(), vec!["s1", "s2"]);

        let expired = db
            .with_session("s1", |tx| tx.take_expired(Some("s1"), at(8)))
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].call_id, "c1");
        assert!(db.pending_call("c3").unwrap().is_some());

        let taken = db.with_session("s1", |tx| tx.take("c2")).unwrap();
        assert!(taken.is_some());
        assert_eq!(db.log_stats().unwrap().pending_calls, 1);
    }

    #[test]
    fn test_solution_counters() {
        let db = test_db();
        let update = |outcome| SolutionUpdate {
            key: "solution:ab".to_string(),
            signature: "Read: not found".to_string(),
            tool_sequence: vec!["Read".to_string(), "Write".to_string()],
            outcome,
            at: at(0),
        };
        db.with_session("s1", |tx| {
            tx.apply_solution_update(&update(SolutionOutcome::Success))?;
            tx.apply_solution_update(&update(SolutionOutcome::Success))?;
            tx.apply_solution_update(&update(SolutionOutcome::Failure))
        })
        .unwrap();

        let solution = db.solution("solution:ab").unwrap().unwrap();
        assert_eq!(solution.successes, 2);
        assert_eq!(solution.failures, 1);
        assert_eq!(solution.tool_sequence, vec!["Read", "Write"]);
        assert!((solution.effectiveness() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_state_round_trip() {
        let db = test_db();
        let state = SessionState::new("s1", at(0), Some("/p"));
        db.with_session("s1", |tx| {
            assert!(tx.load_state()?.is_none());
            tx.save_state(&state)
        })
        .unwrap();
        let loaded = db.with_session("s1", |tx| tx.load_state()).unwrap();
        assert_eq!(loaded, Some(state));
    }

    #[test]
    fn test_file_accesses_stored() {
        let db = test_db();
        let files = vec![FileAccess {
            path: "/a/b.rs".to_string(),
            mode: AccessMode::Modify,
            is_primary: true,
            is_expansion: false,
        }];
        db.with_session("s1", |tx| tx.record_file_accesses("tool:s1:1", Some(at(3)), &files))
            .unwrap();

        let stored = db.file_accesses("s1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].access, files[0]);
        assert_eq!(stored[0].accessed_at, Some(at(3)));
    }
}
