//! TOML configuration for a load test run.
//!
//! A config file holds an optional `[globals]` table and one table per device
//! under test. Device tables are kept as raw TOML here and only turned into a
//! [`DeviceConfig`] later, so a malformed device fails on its own without
//! taking the rest of the run down with it.

pub mod device;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use device::{DeviceConfig, PhaseParams, RemoteEndpoint, TestType, TrafficType};

/// Name of the table holding run-wide settings (matched case-insensitively).
pub const GLOBALS_SECTION: &str = "globals";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid [globals] section: {0}")]
    Globals(#[source] toml::de::Error),

    #[error("[{section}] missing required key '{key}'")]
    MissingKey { section: String, key: String },

    #[error("[{section}] key '{key}' is not numeric: {value}")]
    NotNumeric {
        section: String,
        key: String,
        value: String,
    },

    #[error("[{section}] key '{key}' is invalid: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        reason: String,
    },

    #[error("[{section}] device_id {id} is already used by [{other}]")]
    DuplicateDeviceId {
        section: String,
        id: u32,
        other: String,
    },

    #[error("[{section}] port {port} is already used by [{other}]")]
    PortCollision {
        section: String,
        port: u16,
        other: String,
    },
}

// ---------------------------------------------------------------------------
// Globals
// ---------------------------------------------------------------------------

/// Run-wide settings. Every field has a default, and a config file without a
/// `[globals]` table runs with all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Globals {
    /// Base directory under which each run gets its own log tree.
    pub log_dir: PathBuf,
    /// Whether traffic tool output is written to log files at all.
    #[serde(deserialize_with = "bool_or_int")]
    pub logging: bool,
    /// Prefix prepended to every log file name.
    pub log_prefix: String,
    /// Name (or path) of the traffic tool, used both locally and remotely.
    pub iperf: String,
    /// Extra time a phase waits past its duration before tearing down.
    pub phase_grace_secs: u64,
    /// Extra time the whole run waits past the longest device duration.
    pub run_grace_secs: u64,
    /// Upper bound on any single remote command (connect, kill, close).
    pub command_timeout_secs: u64,
    /// Upper bound on draining captured remote output into its log.
    pub drain_timeout_secs: u64,
    /// How long a local process gets between SIGTERM and SIGKILL.
    pub terminate_timeout_secs: u64,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("loadTestLogs"),
            logging: true,
            log_prefix: "Undefined-".to_string(),
            iperf: "iperf".to_string(),
            phase_grace_secs: 3,
            run_grace_secs: 5,
            command_timeout_secs: 10,
            drain_timeout_secs: 5,
            terminate_timeout_secs: 5,
        }
    }
}

impl Globals {
    pub fn timing(&self) -> Timing {
        Timing {
            phase_grace: Duration::from_secs(self.phase_grace_secs),
            run_grace: Duration::from_secs(self.run_grace_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            terminate_timeout: Duration::from_secs(self.terminate_timeout_secs),
        }
    }
}

/// Accepts `logging = true` as well as the older `logging = 1` form.
fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

/// Every bounded wait used while running a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub phase_grace: Duration,
    pub run_grace: Duration,
    pub command_timeout: Duration,
    pub drain_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Globals::default().timing()
    }
}

// ---------------------------------------------------------------------------
// LoadTestConfig
// ---------------------------------------------------------------------------

/// One device table, not yet validated.
#[derive(Debug, Clone)]
pub struct DeviceSection {
    pub name: String,
    pub table: toml::Table,
}

impl DeviceSection {
    pub fn to_device(&self) -> Result<DeviceConfig, ConfigError> {
        DeviceConfig::from_section(self)
    }
}

/// A parsed config file.
#[derive(Debug, Clone, Default)]
pub struct LoadTestConfig {
    pub globals: Globals,
    pub devices: Vec<DeviceSection>,
}

impl LoadTestConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = content.parse()?;
        info!(
            path = %path.display(),
            devices = config.devices.len(),
            "loaded load test configuration"
        );
        Ok(config)
    }
}

impl std::str::FromStr for LoadTestConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let root: toml::Table = s.parse()?;

        let mut globals = None;
        let mut devices = Vec::new();

        for (name, value) in root {
            if name.eq_ignore_ascii_case(GLOBALS_SECTION) {
                globals = Some(value.try_into::<Globals>().map_err(ConfigError::Globals)?);
                continue;
            }
            match value {
                toml::Value::Table(table) => devices.push(DeviceSection { name, table }),
                other => {
                    warn!(
                        key = %name,
                        kind = other.type_str(),
                        "ignoring top-level key that is not a device table"
                    );
                }
            }
        }

        let globals = globals.unwrap_or_else(|| {
            debug!("no [globals] section, using defaults");
            Globals::default()
        });

        Ok(Self { globals, devices })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
