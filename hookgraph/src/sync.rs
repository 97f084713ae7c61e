//! hookgraph-sync - CLI tool to project the hook log into the graph store
//!
//! One-shot by default: syncs a single session (`--session`) or every
//! session with unsynced records. `--watch` keeps sweeping on an interval.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/hookgraph/hookgraph.db (~/.local/share/hookgraph/hookgraph.db)
//! - Logs: $XDG_STATE_HOME/hookgraph/hookgraph.log (~/.local/state/hookgraph/hookgraph.log)
//! - Config: $XDG_CONFIG_HOME/hookgraph/config.toml (~/.config/hookgraph/config.toml)

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use hookgraph_core::sync::SessionSyncReport;
use hookgraph_core::{BlockingSynchronizer, Config, Database, Recorder, SyncReport, Synchronizer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "hookgraph-sync")]
#[command(about = "Project recorded hook telemetry into the graph store")]
#[command(version)]
struct Args {
    /// Sync only this session instead of every session with pending work
    #[arg(long, conflicts_with = "watch")]
    session: Option<String>,

    /// Surface expired pending tool calls as orphaned before syncing
    #[arg(long)]
    evict: bool,

    /// Print log statistics and exit
    #[arg(long)]
    stats: bool,

    /// Watch mode - keep syncing instead of one-shot
    #[arg(short, long)]
    watch: bool,

    /// Seconds between sweeps (only with --watch; defaults to config)
    #[arg(long)]
    interval: Option<u64>,

    /// Verbose output (-v per-session details)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        hookgraph_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!(session = ?args.session, watch = args.watch, "hookgraph-sync starting");

    let db_path = config.resolved_database_path();
    tracing::info!(path = %db_path.display(), "Opening database");

    let db = Database::open_with(&db_path, &config.store).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    let db = Arc::new(db);

    if args.stats {
        return print_stats(&db);
    }

    let recorder = Recorder::new(db.clone(), &config);
    if args.evict {
        run_eviction(&recorder)?;
    }

    let Some(synchronizer) = Synchronizer::from_config(db, &config.graph, Some(db_path))
        .context("failed to create graph synchronizer")?
    else {
        if args.evict {
            return Ok(());
        }
        bail!("graph sync is not configured; set [graph] enabled and uri, or NEO4J_URI");
    };
    let synchronizer =
        BlockingSynchronizer::new(synchronizer).context("failed to start sync runtime")?;

    if args.watch {
        let interval = args.interval.unwrap_or(config.graph.watch_interval_secs);
        return run_watch_mode(&synchronizer, &recorder, &args, interval);
    }

    match &args.session {
        Some(session_id) => {
            let report = synchronizer
                .sync_session(session_id)
                .with_context(|| format!("sync failed for session {}", session_id))?;
            print_session(&report);
        }
        None => {
            let report = synchronizer.sync_all().context("sync failed")?;
            print_sync_result(&report, args.verbose);
            if report.failed() > 0 {
                bail!("{} session(s) failed to sync", report.failed());
            }
        }
    }

    tracing::info!("hookgraph-sync complete");
    Ok(())
}

fn run_eviction(recorder: &Recorder) -> Result<()> {
    let evicted = recorder
        .evict_expired(chrono::Utc::now())
        .context("failed to evict expired tool calls")?;
    if evicted > 0 {
        println!("Evicted {} orphaned tool call(s)", evicted);
    }
    tracing::info!(evicted, "Eviction sweep complete");
    Ok(())
}

/// Run continuous watch mode
fn run_watch_mode(
    synchronizer: &BlockingSynchronizer,
    recorder: &Recorder,
    args: &Args,
    interval_secs: u64,
) -> Result<()> {
    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "Watch mode active (every {}s). Press Ctrl+C to stop.",
        interval_secs
    );

    let mut iteration = 0u64;
    while running.load(Ordering::SeqCst) {
        iteration += 1;

        if let Err(e) = recorder.evict_expired(chrono::Utc::now()) {
            tracing::warn!(error = %e, "Eviction sweep failed");
        }

        match synchronizer.sync_all() {
            Ok(report) if report.nodes() + report.edges() > 0 || report.failed() > 0 => {
                let timestamp = chrono::Local::now().format("%H:%M:%S");
                println!(
                    "[{}] Synced: {} sessions, {} nodes, {} edges, {} failed",
                    timestamp,
                    report.sessions.len(),
                    report.nodes(),
                    report.edges(),
                    report.failed()
                );
                if args.verbose >= 1 {
                    for session in &report.sessions {
                        print_session(session);
                    }
                }
                tracing::info!(
                    iteration,
                    nodes = report.nodes(),
                    edges = report.edges(),
                    failed = report.failed(),
                    "watch sync iteration"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(iteration, error = %e, "Watch sync iteration failed"),
        }

        // Sleep in short steps so Ctrl+C is honored promptly
        for _ in 0..interval_secs.max(1) {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }

    println!("Watch mode stopped.");
    tracing::info!("hookgraph-sync watch mode stopped");
    Ok(())
}

fn print_stats(db: &Database) -> Result<()> {
    let stats = db.log_stats().context("failed to read log statistics")?;
    println!("Sessions:       {}", stats.sessions);
    println!("Records:        {}", stats.records);
    println!("  Unsynced:     {}", stats.unsynced);
    println!("  Quarantined:  {}", stats.quarantined);
    println!("Pending calls:  {}", stats.pending_calls);
    println!("Solutions:      {}", stats.solutions);
    Ok(())
}

fn print_session(report: &SessionSyncReport) {
    if report.skipped {
        println!("  {}: skipped (sync already running)", report.session_id);
        return;
    }
    match &report.error {
        Some(error) => println!(
            "  {}: {} nodes, {} edges, error: {}",
            report.session_id, report.nodes, report.edges, error
        ),
        None => println!(
            "  {}: {} nodes, {} edges",
            report.session_id, report.nodes, report.edges
        ),
    }
}

/// Print sync result summary
fn print_sync_result(report: &SyncReport, verbose: u8) {
    println!("\nSync complete:");
    println!("  Sessions: {}", report.sessions.len());
    println!("  Nodes:    {}", report.nodes());
    println!("  Edges:    {}", report.edges());

    if verbose >= 1 {
        for session in &report.sessions {
            print_session(session);
        }
    }

    let failed: Vec<_> = report
        .sessions
        .iter()
        .filter(|s| s.error.is_some())
        .collect();
    if !failed.is_empty() {
        println!("\nErrors ({}):", failed.len());
        for session in failed {
            print_session(session);
        }
    }
}
