//! Virtual-clock limiter with transient retry

use super::volume::Volume;
use crate::config::LimiterConfig;
use crate::metrics::Metrics;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Limiter errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LimiterError {
    #[error("Unknown resource in volume: {0}")]
    UnknownResource(String),

    #[error("Invalid limit for {resource}: {reason}")]
    InvalidLimit { resource: String, reason: String },

    #[error("Volume too large to schedule: {0}")]
    VolumeTooLarge(String),
}

/// Classifies operation failures that should re-enter admission
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Admission gate for a resource with several linear rate limits
pub struct Limiter {
    seconds_per_unit: HashMap<String, f64>,
    next_available: Mutex<Instant>,
    retry_backoff: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Limiter {
    /// Default wait before a transient failure re-enters admission
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

    /// Create a limiter allowing `limits[r]` units of each resource per `interval`
    pub fn new(limits: &HashMap<String, u64>, interval: Duration) -> Result<Self, LimiterError> {
        if interval.is_zero() {
            return Err(LimiterError::InvalidLimit {
                resource: "*".to_string(),
                reason: "interval must be positive".to_string(),
            });
        }

        let mut seconds_per_unit = HashMap::with_capacity(limits.len());
        for (resource, &max_units) in limits {
            if max_units == 0 {
                return Err(LimiterError::InvalidLimit {
                    resource: resource.clone(),
                    reason: "max units per interval must be positive".to_string(),
                });
            }
            seconds_per_unit.insert(resource.clone(), interval.as_secs_f64() / max_units as f64);
        }

        debug!(
            "Limiter: init with limits {:?}, interval {:?}, seconds per unit {:?}",
            limits, interval, seconds_per_unit
        );

        Ok(Self {
            seconds_per_unit,
            next_available: Mutex::new(Instant::now()),
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
            metrics: None,
        })
    }

    /// Create from the `[limiter]` configuration section
    pub fn from_config(config: &LimiterConfig) -> Result<Self, LimiterError> {
        Ok(Self::new(&config.limits, config.interval())?.with_retry_backoff(config.retry_backoff()))
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Reservation length for a volume; the most constraining resource wins
    pub fn duration(&self, volume: &Volume) -> Result<Duration, LimiterError> {
        let mut seconds: f64 = 0.0;
        for (resource, units) in volume.iter() {
            let per_unit = self
                .seconds_per_unit
                .get(resource)
                .ok_or_else(|| LimiterError::UnknownResource(resource.to_string()))?;
            seconds = seconds.max(units as f64 * per_unit);
        }
        Duration::try_from_secs_f64(seconds)
            .map_err(|_| LimiterError::VolumeTooLarge(volume.to_string()))
    }

    /// Current value of the virtual clock
    pub fn next_available(&self) -> Instant {
        *self.clock()
    }

    /// Wait for a slot sized by `volume`, then run `operation`.
    ///
    /// Transient failures sleep for the retry backoff and take a fresh
    /// reservation; any other failure is returned as is.
    pub async fn run<F, Fut, T, E>(&self, volume: &Volume, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + From<LimiterError> + fmt::Display,
    {
        let duration = self.duration(volume)?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let now = Instant::now();
            let target = self.reserve(now, duration, volume)?;
            let wait = target.saturating_duration_since(now);

            debug!(
                "Limiter: run with volume {}, duration {:?}, attempt {}, sleeping {:?}",
                volume, duration, attempt, wait
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_limiter_wait(wait);
            }

            if !wait.is_zero() {
                tokio::time::sleep_until(target).await;
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(
                        "Transient failure on attempt {}: {}, retrying in {:?}",
                        attempt, e, self.retry_backoff
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_limiter_retry();
                    }
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Charge `volume` against the clock without running anything
    pub fn alloc(&self, volume: &Volume) -> Result<Duration, LimiterError> {
        let duration = self.duration(volume)?;
        let now = Instant::now();
        let mut next = self.clock();
        *next = (*next)
            .max(now)
            .checked_add(duration)
            .ok_or_else(|| LimiterError::VolumeTooLarge(volume.to_string()))?;
        debug!("Limiter: alloc with volume {}, duration {:?}", volume, duration);
        Ok(duration)
    }

    fn reserve(
        &self,
        now: Instant,
        duration: Duration,
        volume: &Volume,
    ) -> Result<Instant, LimiterError> {
        let mut next = self.clock();
        let target = (*next).max(now);
        *next = target
            .checked_add(duration)
            .ok_or_else(|| LimiterError::VolumeTooLarge(volume.to_string()))?;
        Ok(target)
    }

    // The clock is a plain scalar, so a poisoned lock still holds a valid value.
    fn clock(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.next_available.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
