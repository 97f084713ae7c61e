//! Local durable log
//!
//! SQLite storage for the append-only record log, the pending-call index,
//! per-session aggregation state and the projection cursors.

pub mod repo;
pub mod schema;

pub use repo::{Database, LogStats, SessionTx, StoredFileAccess};
