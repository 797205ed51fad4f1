use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::DetectConfig;
use crate::detect::incident::IncidentStore;
use crate::detect::stats::BaselineStats;
use crate::detect::Severity;
use crate::lock::LeaseLock;
use crate::storage::{self, Pool};

/// The single serialized resource: the detection pass itself. All instances
/// contend on this one lock id.
pub const DETECT_LOCK_ID: &str = "detect.tick";

/// Leader-elected statistical detection pass over the ERROR stream.
#[derive(Clone)]
pub struct DetectionEngine {
    pool: Pool,
    lock: LeaseLock,
    incidents: IncidentStore,
    cfg: DetectConfig,
}

impl DetectionEngine {
    pub fn new(pool: Pool, cfg: DetectConfig) -> Self {
        let lock = LeaseLock::new(pool.clone());
        let incidents = IncidentStore::new(pool.clone());
        Self {
            pool,
            lock,
            incidents,
            cfg,
        }
    }

    /// Run one detection pass.
    ///
    /// Skips silently when another instance holds the lease. Any failure
    /// after acquisition still releases the lease before returning, and a
    /// failed pass produces no partial incident or correlation.
    pub async fn run_tick(&self) -> Result<()> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.tick_blocking()).await?
    }

    fn tick_blocking(&self) -> Result<()> {
        let lease = match self
            .lock
            .try_acquire(DETECT_LOCK_ID, self.cfg.lease_duration())?
        {
            Some(lease) => lease,
            None => {
                debug!("Detection lease held elsewhere, skipping tick");
                return Ok(());
            }
        };

        let outcome = self.detect_once();
        let released = self.lock.release(&lease);
        outcome.context("Detection pass failed")?;
        released
    }

    fn detect_once(&self) -> Result<()> {
        let now = Utc::now();
        let current_cutoff = now - self.cfg.current_window();

        // The baseline stops where the measurement window begins, so the
        // burst under test does not inflate its own reference distribution.
        let buckets = storage::error_minute_buckets(
            &self.pool,
            now - self.cfg.baseline_window(),
            current_cutoff,
        )?;
        if buckets.len() < self.cfg.min_baseline_buckets {
            info!(
                buckets = buckets.len(),
                needed = self.cfg.min_baseline_buckets,
                "Insufficient baseline history, skipping detection"
            );
            return Ok(());
        }

        let stats = BaselineStats::new(buckets.iter().map(|(_, n)| *n as f64).collect());
        let current = storage::count_uncorrelated_errors(&self.pool, current_cutoff)?;
        let z = stats.z_score(current as f64);

        // Both must hold: statistical significance AND the absolute noise
        // floor. A single stray error in a near-silent service can have a
        // huge Z purely because sigma is tiny.
        if z > self.cfg.z_threshold && current > self.cfg.min_error_count {
            let severity = severity_for_z(z);
            let title = format!(
                "Error burst: {current} errors in {}s (z-score {z:.2}, baseline mean {:.1}/min)",
                self.cfg.current_window_secs,
                stats.mean(),
            );
            let incident = self.incidents.create(&title, severity)?;
            let correlated = storage::correlate_errors(&self.pool, current_cutoff, &incident.id)?;
            warn!(
                incident = %incident.id,
                severity = %severity,
                z,
                errors = current,
                correlated,
                "Anomaly detected"
            );
        } else {
            debug!(z, errors = current, mean = stats.mean(), "No anomaly");
        }

        Ok(())
    }
}

/// HIGH for 3 < Z <= 5, CRITICAL beyond (the sigma-zero sentinel lands here).
fn severity_for_z(z: f64) -> Severity {
    if z > 5.0 {
        Severity::Critical
    } else {
        Severity::High
    }
}

/// Repeating timer that drives `run_tick`. Owned by the composition root;
/// a failed tick is logged and self-heals on the next one.
pub async fn run_detection_loop(engine: DetectionEngine, period: std::time::Duration) {
    info!(period_secs = period.as_secs(), "Detection engine started");

    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;

        if let Err(e) = engine.run_tick().await {
            error!("Detection tick failed: {e:#}");
        }
    }
}
