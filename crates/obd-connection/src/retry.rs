//! Exponential backoff with jitter for connect, init and operation retries

use obd_protocol::ObdError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction of the capped delay applied as +/- random jitter
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// Adapter connection attempts
    pub fn connect() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }

    /// Adapter initialization
    pub fn init() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Individual diagnostic operations
    pub fn operation() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            backoff_multiplier: 1.5,
            jitter_factor: 0.1,
        }
    }

    /// Delay before retry number `attempt` (1-based) without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let delay = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay before retry number `attempt` with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.base_delay(attempt).as_millis() as f64;
        let range = capped * self.jitter_factor;
        if range <= 0.0 {
            return Duration::from_millis(capped as u64);
        }
        let jitter = rand::thread_rng().gen_range(-range..=range);
        Duration::from_millis((capped + jitter).max(0.0).round() as u64)
    }

    /// Run `operation` until it succeeds or attempts run out, returning the last error
    pub async fn retry<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, ObdError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ObdError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    warn!("[retry] {} failed after {} attempts: {}", label, attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay(attempt);
                    debug!(
                        "[retry] {} attempt {}/{} failed: {}, retrying in {:?}",
                        label, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Apply `OBD_CONNECT_*` style overrides
    pub fn with_overrides(
        mut self,
        max_attempts: Option<u32>,
        base_delay_ms: Option<u64>,
        max_delay_ms: Option<u64>,
    ) -> Self {
        if let Some(v) = max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = base_delay_ms {
            self.base_delay_ms = v;
        }
        if let Some(v) = max_delay_ms {
            self.max_delay_ms = v;
        }
        self
    }
}
