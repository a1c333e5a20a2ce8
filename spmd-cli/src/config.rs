//! Configuration loading from spmd.toml
//!
//! Group and launcher defaults can be set in an `spmd.toml` file. The file is
//! discovered by walking up from the current directory; command-line flags
//! override whatever it sets.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// File name looked for during discovery
pub const CONFIG_FILE_NAME: &str = "spmd.toml";

/// spmd configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpmdConfig {
    /// Group shape and synchronization
    #[serde(default)]
    pub group: GroupConfig,
    /// How tasks are started
    #[serde(default)]
    pub launcher: LauncherConfig,
}

/// How the tasks of a group are hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// One OS process per task (default)
    #[default]
    Process,
    /// One thread per task inside the launcher
    Thread,
}

/// Group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Number of tasks
    #[serde(default = "default_tasks")]
    pub tasks: usize,
    /// Rank that runs the manager workload
    #[serde(default)]
    pub manager_rank: usize,
    /// Barrier before the workload starts
    #[serde(default = "default_sync_starts")]
    pub sync_starts: bool,
    /// Barrier after the workload ends
    #[serde(default)]
    pub sync_ends: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            tasks: default_tasks(),
            manager_rank: 0,
            sync_starts: default_sync_starts(),
            sync_ends: false,
        }
    }
}

fn default_tasks() -> usize {
    4
}
fn default_sync_starts() -> bool {
    true
}

/// Launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Isolation mode: "process" or "thread"
    #[serde(default)]
    pub isolation: IsolationMode,
    /// Wall-clock limit for the whole group (e.g. "60s", "5m"); "0s" disables it
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::default(),
            timeout: default_timeout(),
        }
    }
}

fn default_timeout() -> String {
    "0s".to_string()
}

impl SpmdConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        Self::discover_from(&std::env::current_dir().ok()?)
    }

    /// Walk up from `start` looking for [`CONFIG_FILE_NAME`]
    pub fn discover_from(start: &Path) -> Option<Self> {
        let mut dir = start.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return match Self::load(&config_path) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        tracing::warn!(path = %config_path.display(), error = %e, "ignoring unreadable config");
                        None
                    }
                };
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Launcher timeout, `None` when disabled
    pub fn timeout(&self) -> anyhow::Result<Option<Duration>> {
        let nanos = Self::parse_duration(&self.launcher.timeout)?;
        Ok((nanos > 0).then(|| Duration::from_nanos(nanos)))
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# spmd Configuration

[group]
# Number of tasks in the group
tasks = 4
# Rank that runs the manager workload
manager_rank = 0
# Barrier before the workload starts
sync_starts = true
# Barrier after the workload ends
sync_ends = false

[launcher]
# Isolation mode: "process" or "thread"
isolation = "process"
# Wall-clock limit for the whole group ("0s" disables it)
timeout = "0s"
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m") to nanoseconds
    pub fn parse_duration(s: &str) -> anyhow::Result<u64> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow::anyhow!("Duration must be a non-negative number: {}", s));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok((value * multiplier as f64) as u64)
    }
}
