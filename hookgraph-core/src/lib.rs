//! # hookgraph-core
//!
//! Core library for hookgraph, a recorder for coding-agent hook telemetry.
//!
//! This library provides:
//! - Parsing of inbound hook events
//! - Pre/post tool-call correlation and classification
//! - Session, task and error aggregation
//! - A local durable log in SQLite
//! - Projection of the log into a graph store
//!
//! ## Architecture
//!
//! Data flows through three stages:
//! - **Hook:** one JSON payload per host callback, parsed into a [`HookEvent`]
//! - **Log:** correlated, aggregated records appended per session in one transaction
//! - **Graph:** records synced as nodes, then derived relationships as edges
//!
//! ## Example
//!
//! ```rust,no_run
//! use hookgraph_core::{Config, Database, Recorder};
//! use std::sync::Arc;
//!
//! let config = Config::load().expect("failed to load config");
//! let db = Database::open(&config.resolved_database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let recorder = Recorder::new(Arc::new(db), &config);
//! let outcome = recorder.handle_raw(r#"{"hook_event_name":"SessionStart","session_id":"s1"}"#);
//! assert!(outcome.is_recorded());
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use event::HookEvent;
pub use pipeline::{HookOutcome, Recorder};
pub use sync::{BlockingSynchronizer, SyncReport, Synchronizer};
pub use types::*;

// Public modules
pub mod aggregate;
pub mod classify;
pub mod config;
pub mod correlate;
pub mod db;
pub mod error;
pub mod event;
pub mod graph;
pub mod lock;
pub mod logging;
pub mod pipeline;
pub mod sync;
pub mod transcript;
pub mod types;
