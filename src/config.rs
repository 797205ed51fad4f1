//! Daemon configuration -- TOML file with serde defaults.
//!
//! Every field has a default, so a missing or partial config file yields a
//! runnable daemon. `Config::load` validates cross-field constraints.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub detect: DetectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the API server.
    pub bind: String,
    /// SQLite database path.
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: "data/logsentinel.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Flush the buffer at least this often, even when nearly empty.
    pub flush_interval_secs: u64,
    /// Flush early once this many records are queued.
    pub flush_threshold: usize,
    /// Reject submissions past this many queued + in-flight records.
    pub max_pending: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 5,
            flush_threshold: 100,
            max_pending: 10_000,
        }
    }
}

impl IngestConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectConfig {
    /// Period of the detection timer.
    pub tick_interval_secs: u64,
    /// Lease duration. Must be shorter than the tick interval so a crashed
    /// holder's lease expires before the next tick arrives.
    pub lease_duration_secs: u64,
    /// Trailing window for the per-minute ERROR baseline.
    pub baseline_window_mins: i64,
    /// Minimum baseline buckets before detection is attempted.
    pub min_baseline_buckets: usize,
    /// Trailing window for the current measurement.
    pub current_window_secs: i64,
    /// Z-score significance threshold.
    pub z_threshold: f64,
    /// Absolute noise floor: the current count must exceed this.
    pub min_error_count: i64,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            lease_duration_secs: 45,
            baseline_window_mins: 30,
            min_baseline_buckets: 5,
            current_window_secs: 60,
            z_threshold: 3.0,
            min_error_count: 5,
        }
    }
}

impl DetectConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn baseline_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.baseline_window_mins)
    }

    pub fn current_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.current_window_secs)
    }
}

impl Config {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg: Config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))?
            }
            None => Config::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.detect.lease_duration_secs >= self.detect.tick_interval_secs {
            bail!(
                "detect.lease_duration_secs ({}) must be shorter than detect.tick_interval_secs ({})",
                self.detect.lease_duration_secs,
                self.detect.tick_interval_secs
            );
        }
        if self.ingest.flush_threshold == 0 {
            bail!("ingest.flush_threshold must be at least 1");
        }
        if self.ingest.max_pending < self.ingest.flush_threshold {
            bail!(
                "ingest.max_pending ({}) must be at least ingest.flush_threshold ({})",
                self.ingest.max_pending,
                self.ingest.flush_threshold
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.ingest.flush_threshold, 100);
        assert_eq!(cfg.detect.z_threshold, 3.0);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            "[detect]\ntick_interval_secs = 120\n",
        )
        .unwrap();
        assert_eq!(cfg.detect.tick_interval_secs, 120);
        // untouched sections keep their defaults
        assert_eq!(cfg.detect.lease_duration_secs, 45);
        assert_eq!(cfg.ingest.flush_interval_secs, 5);
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_lease_must_be_shorter_than_tick() {
        let mut cfg = Config::default();
        cfg.detect.lease_duration_secs = 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_max_pending_must_cover_threshold() {
        let mut cfg = Config::default();
        cfg.ingest.max_pending = 10;
        assert!(cfg.validate().is_err());
    }
}
