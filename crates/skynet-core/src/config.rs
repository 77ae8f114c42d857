use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SkynetError};

pub const DEFAULT_CLAIM_TTL_SECS: u64 = 3600;
pub const MIN_CLAIM_TTL_SECS: u64 = 60;
const MAX_UTC_OFFSET_SECS: i32 = 86_400;

/// Top-level daemon config (crond.toml + SKYNET_CRON_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrondConfig {
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub claims: ClaimsConfig,
    /// Throttle groups: name -> max claimed occurrences per fire time.
    #[serde(default)]
    pub groups: BTreeMap<String, usize>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    /// Fleet key; every instance running the same jobs must agree on it.
    #[serde(default)]
    pub key: String,
    /// Owner identity override. Defaults to $HOSTNAME / $HOST.
    pub hostname: Option<String>,
    /// Offset cron specs are evaluated in, in seconds east of UTC.
    #[serde(default)]
    pub utc_offset_secs: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimsBackend {
    /// Shared SQLite file; every process opening it belongs to one fleet.
    #[default]
    Sqlite,
    /// Process-local claims.
    Memory,
    /// No claiming at all: every occurrence runs on this instance.
    Standalone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimsConfig {
    #[serde(default)]
    pub backend: ClaimsBackend,
    #[serde(default = "default_claims_path")]
    pub path: String,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            backend: ClaimsBackend::default(),
            path: default_claims_path(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl ClaimsConfig {
    /// `path` with a leading `~/` expanded to $HOME.
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

/// A shell command run on a cron spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub key: String,
    pub spec: String,
    pub command: String,
    /// Maximum attempts per occurrence (0 and 1 both mean a single attempt).
    #[serde(default)]
    pub retry_times: u32,
    /// Fixed delay between attempts.
    pub retry_interval_ms: Option<u64>,
    /// Name of a throttle group declared under `[groups]`.
    pub group: Option<String>,
    /// Run on every instance without claiming.
    #[serde(default)]
    pub skip_claim: bool,
    /// Kill the command after this many seconds.
    pub timeout_secs: Option<u64>,
}

fn default_claims_path() -> String {
    "~/.skynet/claims.db".to_string()
}
fn default_ttl_secs() -> u64 {
    DEFAULT_CLAIM_TTL_SECS
}

impl CrondConfig {
    /// Load config from a TOML file with SKYNET_CRON_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. $SKYNET_CRON_CONFIG
    ///   3. ~/.skynet/crond.toml
    ///
    /// Nested keys are overridden with `__`, e.g. `SKYNET_CRON_CLAIMS__TTL_SECS`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("SKYNET_CRON_CONFIG").ok())
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading crond config");

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("SKYNET_CRON_").split("__")),
        )
    }

    /// Extract and validate from an already assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: CrondConfig = figment
            .extract()
            .map_err(|e| SkynetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler would only refuse later, or never.
    pub fn validate(&self) -> Result<()> {
        if self.claims.ttl_secs < MIN_CLAIM_TTL_SECS {
            return Err(SkynetError::Config(format!(
                "claims.ttl_secs must be at least {MIN_CLAIM_TTL_SECS}, got {}",
                self.claims.ttl_secs
            )));
        }
        if self.cron.utc_offset_secs.abs() >= MAX_UTC_OFFSET_SECS {
            return Err(SkynetError::Config(format!(
                "cron.utc_offset_secs out of range: {}",
                self.cron.utc_offset_secs
            )));
        }
        if let Some((name, _)) = self.groups.iter().find(|(_, limit)| **limit == 0) {
            return Err(SkynetError::Config(format!(
                "group {name:?} must allow at least one occurrence"
            )));
        }
        for job in &self.jobs {
            if let Some(group) = &job.group {
                if !self.groups.contains_key(group) {
                    return Err(SkynetError::Config(format!(
                        "job {:?} refers to unknown group {group:?}",
                        job.key
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.skynet/crond.toml", home)
}

/// Expand a leading `~/` to $HOME (or `.` when unset).
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(rest)
        }
        None => PathBuf::from(path),
    }
}

/// Create the parent directory of `path` if it does not exist yet.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
