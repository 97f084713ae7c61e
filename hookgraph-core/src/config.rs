//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/hookgraph/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/hookgraph/` (~/.config/hookgraph/)
//! - Data: `$XDG_DATA_HOME/hookgraph/` (~/.local/share/hookgraph/)
//! - State/Logs: `$XDG_STATE_HOME/hookgraph/` (~/.local/state/hookgraph/)
//!
//! Graph credentials may also come from `NEO4J_URI`, `NEO4J_USER`,
//! `NEO4J_PASSWORD` and `NEO4J_DATABASE`; environment values win over the file.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Pre/post matching and payload limits
    #[serde(default)]
    pub correlator: CorrelatorConfig,

    /// Task-boundary heuristics
    #[serde(default)]
    pub tasks: TaskConfig,

    /// Local durable log settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Graph store connection (optional)
    #[serde(default)]
    pub graph: GraphConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Correlator configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CorrelatorConfig {
    /// Seconds a "before" half may wait for its "after" half
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,

    /// Max characters kept from serialized tool input
    #[serde(default = "default_input_limit")]
    pub input_limit: usize,

    /// Max characters kept from tool output
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,

    /// Max characters kept from prompt text
    #[serde(default = "default_prompt_limit")]
    pub prompt_limit: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: default_pending_ttl(),
            input_limit: default_input_limit(),
            output_limit: default_output_limit(),
            prompt_limit: default_prompt_limit(),
        }
    }
}

impl CorrelatorConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.pending_ttl_secs == 0 {
            return Err(Error::Config(
                "correlator.pending_ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.input_limit == 0 || self.output_limit == 0 || self.prompt_limit == 0 {
            return Err(Error::Config(
                "correlator limits must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_pending_ttl() -> u64 {
    300
}

fn default_input_limit() -> usize {
    2000
}

fn default_output_limit() -> usize {
    5000
}

fn default_prompt_limit() -> usize {
    1000
}

/// Task grouping configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TaskConfig {
    /// Minutes between prompts after which a new task starts
    #[serde(default = "default_gap_minutes")]
    pub gap_minutes: u64,

    /// Minimum keyword Jaccard overlap to stay in the current task
    #[serde(default = "default_keyword_overlap")]
    pub keyword_overlap: f64,

    /// Keywords extracted per prompt
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            gap_minutes: default_gap_minutes(),
            keyword_overlap: default_keyword_overlap(),
            max_keywords: default_max_keywords(),
        }
    }
}

impl TaskConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.keyword_overlap) {
            return Err(Error::Config(
                "tasks.keyword_overlap must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.max_keywords == 0 {
            return Err(Error::Config(
                "tasks.max_keywords must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_gap_minutes() -> u64 {
    10
}

fn default_keyword_overlap() -> f64 {
    0.2
}

fn default_max_keywords() -> usize {
    20
}

/// Local durable log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Override for the database location
    pub path: Option<PathBuf>,

    /// How long a writer waits on a locked database before failing
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_busy_timeout() -> u64 {
    5000
}

/// Graph store configuration
///
/// When enabled, session records are projected into a Neo4j database
/// after they are durable locally.
#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    /// Enable/disable graph synchronization
    #[serde(default)]
    pub enabled: bool,

    /// Server URL (e.g., `http://localhost:7474`)
    pub uri: Option<String>,

    /// Basic auth user
    pub user: Option<String>,

    /// Basic auth password
    pub password: Option<String>,

    /// Target database name
    #[serde(default = "default_graph_database")]
    pub database: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_graph_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient failures
    #[serde(default = "default_graph_max_retries")]
    pub max_retries: usize,

    /// Spawn a background sync when a session ends
    #[serde(default = "default_true")]
    pub sync_on_session_end: bool,

    /// Seconds between runs in watch mode
    #[serde(default = "default_watch_interval")]
    pub watch_interval_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: None,
            user: None,
            password: None,
            database: default_graph_database(),
            timeout_secs: default_graph_timeout(),
            max_retries: default_graph_max_retries(),
            sync_on_session_end: true,
            watch_interval_secs: default_watch_interval(),
        }
    }
}

impl GraphConfig {
    /// Check if graph sync is properly configured and enabled
    pub fn is_ready(&self) -> bool {
        self.enabled && self.uri.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.uri.is_none() {
            return Err(Error::Config(
                "graph.uri is required when graph sync is enabled".to_string(),
            ));
        }
        if self.user.is_some() != self.password.is_some() {
            return Err(Error::Config(
                "graph.user and graph.password must be set together".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "graph.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `NEO4J_*` environment overrides.
    fn apply_env(&mut self) {
        if let Ok(uri) = std::env::var("NEO4J_URI") {
            self.uri = Some(uri);
            self.enabled = true;
        }
        if let Ok(user) = std::env::var("NEO4J_USER") {
            self.user = Some(user);
        }
        if let Ok(password) = std::env::var("NEO4J_PASSWORD") {
            self.password = Some(password);
        }
        if let Ok(database) = std::env::var("NEO4J_DATABASE") {
            self.database = database;
        }
    }
}

fn default_graph_database() -> String {
    "neo4j".to_string()
}

fn default_graph_timeout() -> u64 {
    5
}

fn default_graph_max_retries() -> usize {
    2
}

fn default_watch_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            tracing::debug!("No config file found at {:?}, using defaults", config_path);
            Config::default()
        };

        config.graph.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.correlator.validate()?;
        self.tasks.validate()?;
        self.graph.validate()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/hookgraph/config.toml` (~/.config/hookgraph/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("hookgraph").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/hookgraph/` (~/.local/share/hookgraph/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("hookgraph")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/hookgraph/` (~/.local/state/hookgraph/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("hookgraph")
    }

    /// Returns the default database file path
    ///
    /// `$XDG_DATA_HOME/hookgraph/hookgraph.db` (~/.local/share/hookgraph/hookgraph.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("hookgraph.db")
    }

    /// Database path honoring `[store] path`
    pub fn resolved_database_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(Self::database_path)
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/hookgraph/hookgraph.log` (~/.local/state/hookgraph/hookgraph.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("hookgraph.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
