use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capabilities::http::{ValidatedUrl, MAX_TIMEOUT_MS};
use crate::error::ConfigError;
use crate::model::LatLon;

pub const ENV_BASE_URL: &str = "TRIAGE_MONITOR_BASE_URL";
pub const ENV_API_PREFIX: &str = "TRIAGE_MONITOR_API_PREFIX";
pub const ENV_POLL_INTERVAL_MS: &str = "TRIAGE_MONITOR_POLL_INTERVAL_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "TRIAGE_MONITOR_REQUEST_TIMEOUT_MS";

const MIN_POLL_INTERVAL_MS: u64 = 250;
const MIN_ZOOM: f64 = 1.0;
const MAX_ZOOM: f64 = 20.0;

// ============================================================================
// Map
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Centre of the aggregate map.
    pub fallback_center: LatLon,
    pub overview_zoom: f64,
    pub detail_zoom: f64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            fallback_center: LatLon::from_finite(23.2599, 77.4126),
            overview_zoom: 13.0,
            detail_zoom: 14.0,
        }
    }
}

impl MapConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (lat, lon) = self.fallback_center.as_tuple();
        if !lat.is_finite() || !lon.is_finite() {
            return Err(ConfigError::Invalid(
                "map.fallback_center must be finite".into(),
            ));
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(ConfigError::Invalid(format!(
                "map.fallback_center ({lat}, {lon}) is out of range"
            )));
        }
        for (name, zoom) in [
            ("overview_zoom", self.overview_zoom),
            ("detail_zoom", self.detail_zoom),
        ] {
            if !(MIN_ZOOM..=MAX_ZOOM).contains(&zoom) {
                return Err(ConfigError::Invalid(format!(
                    "map.{name} must be between {MIN_ZOOM} and {MAX_ZOOM}, got {zoom}"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(MonitorConfig::default().poll_interval_ms),
        }
    }
}

impl SyncConfig {
    /// Raises `poll_interval` to the shortest period the monitor accepts.
    #[must_use]
    pub fn clamped(self) -> Self {
        let floor = Duration::from_millis(MIN_POLL_INTERVAL_MS);
        if self.poll_interval < floor {
            warn!(requested = ?self.poll_interval, floor = ?floor, "poll interval too short, clamped");
        }
        Self {
            poll_interval: self.poll_interval.max(floor),
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub base_url: String,
    pub api_prefix: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub stale_after_ms: u64,
    pub simulate_batch_size: u32,
    pub dashboard_card_limit: usize,
    pub symptom_chip_limit: usize,
    pub preview_length: usize,
    pub map: MapConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            api_prefix: "/api/v1".into(),
            poll_interval_ms: 5_000,
            request_timeout_ms: 30_000,
            stale_after_ms: 15_000,
            simulate_batch_size: 3,
            dashboard_card_limit: 8,
            symptom_chip_limit: 2,
            preview_length: 80,
            map: MapConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ValidatedUrl::new(&self.base_url)
            .map_err(|e| ConfigError::Invalid(format!("base_url: {e}")))?;

        if !self.api_prefix.is_empty() && !self.api_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(
                "api_prefix must be empty or start with '/'".into(),
            ));
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "poll_interval_ms must be at least {MIN_POLL_INTERVAL_MS}"
            )));
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::Invalid(format!(
                "request_timeout_ms must be between 1 and {MAX_TIMEOUT_MS}"
            )));
        }
        if self.stale_after_ms < self.poll_interval_ms {
            return Err(ConfigError::Invalid(
                "stale_after_ms must not be shorter than poll_interval_ms".into(),
            ));
        }
        if self.simulate_batch_size == 0 {
            return Err(ConfigError::Invalid("simulate_batch_size must be > 0".into()));
        }
        if self.dashboard_card_limit == 0 {
            return Err(ConfigError::Invalid("dashboard_card_limit must be > 0".into()));
        }
        if self.preview_length < 4 {
            return Err(ConfigError::Invalid("preview_length must be at least 4".into()));
        }
        self.map.validate()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        info!(path = %path.display(), base_url = %config.base_url, "loaded monitor config");
        Ok(config)
    }

    /// Applies overrides from a variable lookup, usually `std::env::var`.
    pub fn apply_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL) {
            debug!(var = ENV_BASE_URL, "config override");
            self.base_url = url;
        }
        if let Some(prefix) = lookup(ENV_API_PREFIX) {
            debug!(var = ENV_API_PREFIX, "config override");
            self.api_prefix = prefix;
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = parse_ms(ENV_POLL_INTERVAL_MS, &raw)?;
            self.stale_after_ms = self.stale_after_ms.max(self.poll_interval_ms);
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            self.request_timeout_ms = parse_ms(ENV_REQUEST_TIMEOUT_MS, &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env_overrides(|key| std::env::var(key).ok())
    }

    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

fn parse_ms(var: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|_| {
        ConfigError::Invalid(format!(
            "{var} must be a whole number of milliseconds, got '{raw}'"
        ))
    })
}
