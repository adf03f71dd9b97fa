//! Configuration loading and database path resolution
//!
//! Resolution order for both the config file and the database path:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file (database path only)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing config file is not an error: a warning is logged and compiled
//! defaults are used. A config file that exists but does not parse is.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::models::Stage;
use crate::{Error, Result};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "DQH_CONFIG";
/// Environment variable naming the database file
pub const DATABASE_ENV_VAR: &str = "DQH_DATABASE";

/// Complete harness configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarnessConfig {
    pub database: DatabaseConfig,
    pub tracker: TrackerPolicy,
    pub experiment: Option<ExperimentConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Upper bound for lock-contention retries
    pub max_lock_wait_ms: u64,
    pub max_connections: u32,
    /// SQLite busy_timeout applied to every connection
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_lock_wait_ms: 5000,
            max_connections: 8,
            busy_timeout_ms: 250,
        }
    }
}

/// What `open` does when a closed run already exists for the same key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReopenPolicy {
    /// Create a new, distinct validation run
    #[default]
    NewRun,
    /// Refuse with `DuplicateRun`
    Reject,
}

/// What `record_check` does with a repeated `check_name` within one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateCheckPolicy {
    /// Keep every result; the chronologically last one is scored
    #[default]
    LastWins,
    /// Refuse the repeat with `Conflict`
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerPolicy {
    pub reopen_policy: ReopenPolicy,
    pub duplicate_checks: DuplicateCheckPolicy,
}

/// Experiment under comparison
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentConfig {
    pub name: String,
    pub baseline_run_id: Option<String>,
    /// Tools expected per stage; `None` means every tool is enabled
    pub tools_by_stage: Option<BTreeMap<Stage, Vec<String>>>,
}

impl ExperimentConfig {
    /// Whether `tool` should run for `stage`
    pub fn tool_enabled(&self, stage: Stage, tool: &str) -> bool {
        match &self.tools_by_stage {
            None => true,
            Some(map) => map
                .get(&stage)
                .map(|tools| tools.iter().any(|t| t.eq_ignore_ascii_case(tool)))
                .unwrap_or(false),
        }
    }

    /// (stage, tool) pairs that must appear in a comparison
    pub fn expected_pairs(&self) -> Vec<(Stage, String)> {
        self.tools_by_stage
            .iter()
            .flat_map(|map| map.iter())
            .flat_map(|(stage, tools)| tools.iter().map(move |t| (*stage, t.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    #[serde(default)]
    database: DatabaseConfig,
    #[serde(default)]
    tracker: TrackerPolicy,
    experiment: Option<TomlExperiment>,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlExperiment {
    name: String,
    baseline_run_id: Option<String>,
    tools_by_stage: Option<BTreeMap<String, Vec<String>>>,
}

impl HarnessConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        let experiment = raw.experiment.map(normalize_experiment).transpose()?;

        if raw.database.max_connections == 0 {
            return Err(Error::Config(
                "database.max_connections must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database: raw.database,
            tracker: raw.tracker,
            experiment,
            logging: raw.logging,
        })
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration following the resolution order, falling back to defaults
    pub fn load_or_default(cli_arg: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_arg) {
            Some(path) if path.exists() => Self::load(&path),
            Some(path) => {
                warn!(
                    "Config file not found: {} (using compiled defaults)",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                warn!("No config file found (using compiled defaults)");
                Ok(Self::default())
            }
        }
    }

    /// Apply the database path override chain (CLI > env > file)
    pub fn with_database_override(mut self, cli_arg: Option<&Path>) -> Self {
        if let Some(path) = cli_arg {
            self.database.path = path.to_path_buf();
        } else if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
            self.database.path = PathBuf::from(path);
        }
        self
    }
}

fn normalize_experiment(raw: TomlExperiment) -> Result<ExperimentConfig> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::Config(
            "experiment.name must be a non-empty string".to_string(),
        ));
    }

    let tools_by_stage = match raw.tools_by_stage {
        None => None,
        Some(map) => {
            let mut out: BTreeMap<Stage, Vec<String>> = BTreeMap::new();
            for (key, tools) in map {
                let stage: Stage = key.parse().map_err(|_| {
                    Error::Config(format!(
                        "experiment.tools_by_stage: unknown stage '{}'",
                        key
                    ))
                })?;
                let entry = out.entry(stage).or_default();
                for tool in tools {
                    let tool = tool.trim().to_ascii_lowercase();
                    if !tool.is_empty() && !entry.contains(&tool) {
                        entry.push(tool);
                    }
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(out)
            }
        }
    };

    Ok(ExperimentConfig {
        name,
        baseline_run_id: raw
            .baseline_run_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        tools_by_stage,
    })
}

/// Locate the config file: CLI argument, then environment, then the user config dir
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }

    dirs::config_dir().map(|d| d.join("dqh").join("config.toml"))
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("dqh").join("harness.db"))
        .unwrap_or_else(|| PathBuf::from("./dqh_data/harness.db"))
}
