//! Configuration module for the p2w server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments for the contest server
#[derive(Parser, Debug, Default)]
#[command(name = "p2w-server")]
#[command(author = "p2w-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Ping 2 Win contest server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:5555)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of simultaneously handled connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Path of the winners ledger file
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// Path of the blacklist file (one address per line)
    #[arg(long)]
    pub blacklist: Option<PathBuf>,

    /// Write the resolved configuration to this path and exit
    #[arg(long)]
    pub save_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Serialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub contest: ContestSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener and connection handling
#[derive(Debug, Deserialize, Serialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upper bound on connections handled at once
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long a peer may stay silent before its request is dropped
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Contest rules
#[derive(Debug, Deserialize, Serialize)]
pub struct ContestSection {
    /// Minimum spacing between scored attempts from one address
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_max_username_length")]
    pub max_username_length: usize,
    /// Sessions without a heartbeat for this long are evicted
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_session_sweep_interval_secs")]
    pub session_sweep_interval_secs: u64,
    #[serde(default = "default_rate_limit_prune_interval_secs")]
    pub rate_limit_prune_interval_secs: u64,
}

impl Default for ContestSection {
    fn default() -> Self {
        Self {
            rate_limit_window_secs: default_rate_limit_window_secs(),
            max_username_length: default_max_username_length(),
            session_timeout_secs: default_session_timeout_secs(),
            session_sweep_interval_secs: default_session_sweep_interval_secs(),
            rate_limit_prune_interval_secs: default_rate_limit_prune_interval_secs(),
        }
    }
}

/// On-disk state
#[derive(Debug, Deserialize, Serialize)]
pub struct PersistenceSection {
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default = "default_blacklist_path")]
    pub blacklist_path: PathBuf,
    /// Directory receiving timestamped ledger copies
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default = "default_backup_interval_secs")]
    pub backup_interval_secs: u64,
    /// Tick of the debounced ledger writer
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Number of snapshots kept in `snapshot_dir` (0 = keep all)
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            blacklist_path: default_blacklist_path(),
            snapshot_dir: default_snapshot_dir(),
            backup_interval_secs: default_backup_interval_secs(),
            flush_interval_ms: default_flush_interval_ms(),
            max_snapshots: default_max_snapshots(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Interval of the periodic stats report
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:5555".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_rate_limit_window_secs() -> u64 {
    10
}

fn default_max_username_length() -> usize {
    20
}

fn default_session_timeout_secs() -> u64 {
    30
}

fn default_session_sweep_interval_secs() -> u64 {
    5
}

fn default_rate_limit_prune_interval_secs() -> u64 {
    60
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("winners_5555.json")
}

fn default_blacklist_path() -> PathBuf {
    PathBuf::from("blacklist.txt")
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_backup_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_flush_interval_ms() -> u64 {
    250
}

fn default_max_snapshots() -> usize {
    24
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval_secs() -> u64 {
    10
}

/// Final resolved configuration, immutable for the lifetime of a run
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub rate_limit_window: Duration,
    pub max_username_length: usize,
    pub session_timeout: Duration,
    pub session_sweep_interval: Duration,
    pub rate_limit_prune_interval: Duration,
    pub ledger_path: PathBuf,
    pub blacklist_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub backup_interval: Duration,
    pub flush_interval: Duration,
    pub max_snapshots: usize,
    pub log_level: String,
    pub stats_interval: Duration,
    /// Set when the operator asked for the resolved config to be written out
    pub save_config: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            contest,
            persistence,
            logging,
        } = toml_config;

        Config {
            listen: cli.listen.unwrap_or(server.listen),
            max_connections: cli.max_connections.unwrap_or(server.max_connections).max(1),
            read_timeout: Duration::from_millis(server.read_timeout_ms),
            rate_limit_window: Duration::from_secs(contest.rate_limit_window_secs),
            max_username_length: contest.max_username_length,
            session_timeout: Duration::from_secs(contest.session_timeout_secs),
            session_sweep_interval: Duration::from_secs(contest.session_sweep_interval_secs.max(1)),
            rate_limit_prune_interval: Duration::from_secs(
                contest.rate_limit_prune_interval_secs.max(1),
            ),
            ledger_path: cli.ledger.unwrap_or(persistence.ledger_path),
            blacklist_path: cli.blacklist.unwrap_or(persistence.blacklist_path),
            snapshot_dir: persistence.snapshot_dir,
            backup_interval: Duration::from_secs(persistence.backup_interval_secs.max(1)),
            flush_interval: Duration::from_millis(persistence.flush_interval_ms.max(1)),
            max_snapshots: persistence.max_snapshots,
            log_level: cli.log_level.unwrap_or(logging.level),
            stats_interval: Duration::from_secs(logging.stats_interval_secs.max(1)),
            save_config: cli.save_config,
        }
    }

    /// Convert back into the file representation.
    pub fn to_toml(&self) -> TomlConfig {
        TomlConfig {
            server: ServerSection {
                listen: self.listen.clone(),
                max_connections: self.max_connections,
                read_timeout_ms: self.read_timeout.as_millis() as u64,
            },
            contest: ContestSection {
                rate_limit_window_secs: self.rate_limit_window.as_secs(),
                max_username_length: self.max_username_length,
                session_timeout_secs: self.session_timeout.as_secs(),
                session_sweep_interval_secs: self.session_sweep_interval.as_secs(),
                rate_limit_prune_interval_secs: self.rate_limit_prune_interval.as_secs(),
            },
            persistence: PersistenceSection {
                ledger_path: self.ledger_path.clone(),
                blacklist_path: self.blacklist_path.clone(),
                snapshot_dir: self.snapshot_dir.clone(),
                backup_interval_secs: self.backup_interval.as_secs(),
                flush_interval_ms: self.flush_interval.as_millis() as u64,
                max_snapshots: self.max_snapshots,
            },
            logging: LoggingSection {
                level: self.log_level.clone(),
                stats_interval_secs: self.stats_interval.as_secs(),
            },
        }
    }

    /// Write the configuration as a TOML document, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(&self.to_toml())
            .map_err(|e| ConfigError::TomlSerialize(path.to_path_buf(), e))?;

        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, contents)
            .map_err(|e| ConfigError::FileWrite(path.to_path_buf(), e))?;
        std::fs::rename(&temp_path, path)
            .map_err(|e| ConfigError::FileWrite(path.to_path_buf(), e))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    TomlSerialize(PathBuf, toml::ser::Error),
    FileWrite(PathBuf, std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlSerialize(path, e) => {
                write!(f, "Failed to encode config for '{}': {}", path.display(), e)
            }
            ConfigError::FileWrite(path, e) => {
                write!(f, "Failed to write config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
