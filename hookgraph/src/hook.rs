//! hookgraph-hook - entry point invoked by the agent host for every hook
//!
//! Reads one JSON payload from stdin and appends it to the local log. The
//! host must never be disturbed: this binary prints nothing and always
//! exits 0. Failures go to the log file only.
//!
//! On `SessionEnd`, when graph sync is configured, a detached
//! `hookgraph-sync --session <id>` is spawned so projection happens off
//! the hook path.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/hookgraph/hookgraph.db
//! - Logs: $XDG_STATE_HOME/hookgraph/hookgraph.log
//! - Config: $XDG_CONFIG_HOME/hookgraph/config.toml

use anyhow::{Context, Result};
use hookgraph_core::{Config, Database, HookOutcome, Recorder};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

const SYNC_BIN: &str = "hookgraph-sync";

fn main() {
    let mut raw = String::new();
    if std::io::stdin().read_to_string(&mut raw).is_err() {
        return;
    }

    Config::ensure_xdg_env();

    // A broken config file must not block recording
    let config = Config::load().unwrap_or_default();

    let _log_guard = hookgraph_core::logging::init(&config.logging).ok();

    if let Err(e) = run(&config, &raw) {
        tracing::error!(error = %format!("{:#}", e), "hookgraph-hook failed");
    }
}

fn run(config: &Config, raw: &str) -> Result<()> {
    let db_path = config.resolved_database_path();
    let db = Database::open_with(&db_path, &config.store).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    let recorder = Recorder::new(Arc::new(db), config);

    match recorder.handle_raw(raw) {
        HookOutcome::Recorded {
            session_id, kind, ..
        } if kind == "SessionEnd" => {
            if config.graph.is_ready() && config.graph.sync_on_session_end {
                spawn_sync(&session_id).context("failed to spawn background sync")?;
            }
        }
        HookOutcome::Recorded { .. } => {}
        // Already logged by the recorder
        HookOutcome::Rejected(_) | HookOutcome::Failed(_) => {}
    }

    Ok(())
}

/// Start `hookgraph-sync --session <id>` fully detached from the host.
fn spawn_sync(session_id: &str) -> Result<()> {
    let sync_bin = sync_binary_path();
    tracing::info!(session_id, bin = %sync_bin.display(), "Spawning background sync");

    Command::new(&sync_bin)
        .arg("--session")
        .arg(session_id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("failed to spawn {}", sync_bin.display()))?;

    Ok(())
}

/// Prefer the sync binary installed next to this one, else rely on PATH.
fn sync_binary_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(SYNC_BIN)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(SYNC_BIN))
}
