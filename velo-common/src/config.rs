//! Configuration loading for the velo sync service
//!
//! Configuration is a single TOML file with environment-variable overrides
//! for provider API keys. Unreadable files surface as `Error::Io`; invalid
//! cadences, thresholds, or rate windows fail fast with `Error::Config`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// HTTP listen address for the status API
    pub listen_addr: String,
    /// SQLite database path for the sync-run sink
    pub database_path: String,
    /// Per-job cadences and startup behavior
    pub jobs: JobsConfig,
    /// Events starting within this horizon are "near" (short cadence)
    pub near_horizon_minutes: u64,
    /// A run exceeding this is force-released as a stale lease
    pub max_run_duration_secs: u64,
    pub cache: CacheConfig,
    pub merge: MergeConfig,
    /// Upstream providers, keyed by source name (racing/power/official)
    pub sources: BTreeMap<String, SourceConfig>,
    pub roster: RosterConfig,
}

/// Cadence (seconds) per recurring job type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub riders_cadence_secs: u64,
    pub near_events_cadence_secs: u64,
    pub far_events_cadence_secs: u64,
    pub results_cadence_secs: u64,
    pub cleanup_cadence_secs: u64,
    /// Run every job once at startup before the first timer fires
    pub sync_on_startup: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            riders_cadence_secs: 6 * 3600,
            near_events_cadence_secs: 15 * 60,
            far_events_cadence_secs: 2 * 3600,
            results_cadence_secs: 3600,
            cleanup_cadence_secs: 24 * 3600,
            sync_on_startup: false,
        }
    }
}

/// Cache TTL (seconds) per entity category
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub rider_ttl_secs: u64,
    pub event_ttl_secs: u64,
    pub results_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rider_ttl_secs: 3600,
            event_ttl_secs: 900,
            results_ttl_secs: 6 * 3600,
        }
    }
}

/// Merge policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Primary source; supplies the baseline value for every field
    pub primary: String,
    /// Source priority order for baseline fallback and override tie-breaks
    pub priority: Vec<String>,
    /// Numeric fields a secondary may override beyond the threshold
    pub override_fields: Vec<String>,
    /// Relative difference (percent) a secondary must exceed to override
    pub override_threshold_pct: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            primary: "racing".to_string(),
            priority: vec![
                "racing".to_string(),
                "power".to_string(),
                "official".to_string(),
            ],
            override_fields: vec![
                "ftp".to_string(),
                "weight_kg".to_string(),
                "racing_score".to_string(),
            ],
            override_threshold_pct: 5.0,
        }
    }
}

/// One upstream provider: endpoint plus its own rate budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    /// Maximum requests per window (the provider's own budget)
    pub max_per_window: u32,
    pub window_secs: u64,
    /// Environment variable holding the API key (checked before `api_key`)
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
}

impl SourceConfig {
    /// Resolve the API key: environment variable wins over the TOML value
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(var) = &self.api_key_env {
            if let Ok(key) = std::env::var(var) {
                if !key.trim().is_empty() {
                    return Some(key);
                }
            }
        }
        self.api_key
            .as_ref()
            .filter(|k| !k.trim().is_empty())
            .cloned()
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Entities to sync on the riders job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub club_id: Option<u64>,
    pub rider_ids: Vec<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5823".to_string(),
            database_path: "velo-sync.db".to_string(),
            jobs: JobsConfig::default(),
            near_horizon_minutes: 24 * 60,
            max_run_duration_secs: 30 * 60,
            cache: CacheConfig::default(),
            merge: MergeConfig::default(),
            sources: BTreeMap::new(),
            roster: RosterConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cadences, thresholds, and rate windows; fails fast at startup
    pub fn validate(&self) -> Result<()> {
        let cadences = [
            ("jobs.riders_cadence_secs", self.jobs.riders_cadence_secs),
            (
                "jobs.near_events_cadence_secs",
                self.jobs.near_events_cadence_secs,
            ),
            (
                "jobs.far_events_cadence_secs",
                self.jobs.far_events_cadence_secs,
            ),
            ("jobs.results_cadence_secs", self.jobs.results_cadence_secs),
            ("jobs.cleanup_cadence_secs", self.jobs.cleanup_cadence_secs),
        ];
        for (name, secs) in cadences {
            if secs < 5 {
                return Err(Error::Config(format!(
                    "{name} must be at least 5 seconds (got {secs})"
                )));
            }
        }
        if self.near_horizon_minutes == 0 {
            return Err(Error::Config(
                "near_horizon_minutes must be greater than zero".to_string(),
            ));
        }
        if self.max_run_duration_secs == 0 {
            return Err(Error::Config(
                "max_run_duration_secs must be greater than zero".to_string(),
            ));
        }
        let threshold = self.merge.override_threshold_pct;
        if !(threshold > 0.0 && threshold < 100.0) {
            return Err(Error::Config(format!(
                "merge.override_threshold_pct must be in (0, 100), got {threshold}"
            )));
        }
        if self.merge.primary.trim().is_empty() {
            return Err(Error::Config("merge.primary must be set".to_string()));
        }
        if !self.merge.priority.contains(&self.merge.primary) {
            return Err(Error::Config(format!(
                "merge.priority must include the primary source '{}'",
                self.merge.primary
            )));
        }
        for (name, source) in &self.sources {
            if source.max_per_window == 0 {
                return Err(Error::Config(format!(
                    "sources.{name}.max_per_window must be greater than zero"
                )));
            }
            if source.window_secs == 0 {
                return Err(Error::Config(format!(
                    "sources.{name}.window_secs must be greater than zero"
                )));
            }
            if source.base_url.trim().is_empty() {
                return Err(Error::Config(format!(
                    "sources.{name}.base_url must be set"
                )));
            }
        }
        Ok(())
    }

    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_duration_secs)
    }

    pub fn near_horizon(&self) -> Duration {
        Duration::from_secs(self.near_horizon_minutes * 60)
    }
}
